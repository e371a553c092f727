//! Build-log processing for the publish poll loop.
//!
//! Runner traces are free-form and noisy. The poll loop fetches the whole
//! trace each time; [`TraceCursor`] narrows that to the newly appended
//! suffix, [`clean_lines`] drops the runner's own chatter, and
//! [`milestone_for`] turns known build-tool lines into the short progress
//! string shown in the editor. Anything unrecognized produces no progress
//! update rather than a made-up one.

/// Provider job status collapsed to what the poll loop acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteJobStatus {
    Running,
    Success,
    Failed,
}

/// Map a provider status string onto the three poll states.
///
/// Everything pre-terminal (created, pending, running, preparing,
/// scheduled, waiting_for_resource, manual) keeps the loop polling;
/// canceled and skipped count as failed since the site never built.
pub fn map_job_status(status: &str) -> RemoteJobStatus {
    match status {
        "success" => RemoteJobStatus::Success,
        "failed" | "canceled" | "skipped" => RemoteJobStatus::Failed,
        _ => RemoteJobStatus::Running,
    }
}

/// Tracks how much of a job trace has been processed, so each poll hands
/// back only the newly appended suffix.
#[derive(Debug, Default)]
pub struct TraceCursor {
    seen: usize,
}

impl TraceCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// New suffix since the last call.
    ///
    /// A trace shorter than what was already seen (runner retried, log
    /// rewritten) resets the cursor and yields the whole trace again.
    pub fn advance<'a>(&mut self, trace: &'a str) -> &'a str {
        if trace.len() < self.seen {
            self.seen = 0;
        }
        let suffix = trace.get(self.seen..).unwrap_or(trace);
        self.seen = trace.len();
        suffix
    }
}

/// Split a trace chunk into displayable lines.
///
/// Drops, in this order: ANSI escape sequences, carriage-return progress
/// overwrites (only the final rendering of the line survives), shell
/// echoes (`$ `), runner section markers, the `Running with gitlab-runner`
/// banner, executor preparation banners, and blank lines.
pub fn clean_lines(chunk: &str) -> Vec<String> {
    chunk
        .lines()
        .map(|line| {
            let line = strip_ansi(line);
            match line.rsplit('\r').next() {
                Some(last) => last.to_string(),
                None => line,
            }
        })
        .filter(|line| !is_noise(line))
        .collect()
}

fn is_noise(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty()
        || trimmed.starts_with("$ ")
        || trimmed.contains("section_start:")
        || trimmed.contains("section_end:")
        || trimmed.starts_with("Running with gitlab-runner")
        || (trimmed.starts_with("Preparing the") && trimmed.contains("executor"))
}

/// Remove ANSI escape sequences from one line.
pub fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\u{1b}' {
            if chars.peek() == Some(&'[') {
                chars.next();
                // CSI parameters end at a byte in the @..~ range
                for c in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&c) {
                        break;
                    }
                }
            }
            continue;
        }
        out.push(ch);
    }
    out
}

/// Progress milestone for one trace line, if the line matches a known
/// build-tool step. First match wins; unknown lines return `None` so the
/// previous progress message stands.
pub fn milestone_for(line: &str) -> Option<&'static str> {
    let lower = line.to_lowercase();
    if lower.contains("npm install") || lower.contains("npm ci") {
        Some("Installing dependencies")
    } else if lower.contains("eleventy") || lower.contains("[11ty]") {
        Some("Building site")
    } else if lower.contains("uploading artifacts") {
        Some("Uploading artifacts")
    } else if lower.contains("job succeeded") {
        Some("Done")
    } else {
        None
    }
}
