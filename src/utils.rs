use std::fmt::Display;
use std::sync::LazyLock;
use std::time::Duration;

use console::Style;
use indicatif::ProgressStyle;

const ANSI_BLUE: Style = Style::new().blue();

static STYLE_TREE: LazyLock<Option<ProgressStyle>> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .ok()
        .map(|style| style.progress_chars("=>-"))
});

static STYLE_TASK: LazyLock<Option<ProgressStyle>> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("{spinner:.blue} {msg}")
        .ok()
});

/// Style for the progress bar of a whole task tree.
pub(crate) fn get_style_tree() -> Option<ProgressStyle> {
    STYLE_TREE.clone()
}

/// Style for the spinner of a single running task.
pub(crate) fn get_style_task() -> Option<ProgressStyle> {
    STYLE_TASK.clone()
}

/// Formats a duration as a short, colored suffix, e.g. `(+12ms)`.
pub(crate) fn as_overhead(duration: Duration) -> impl Display {
    ANSI_BLUE.apply_to(format!("(+{}ms)", duration.as_millis()))
}

/// Replaces everything but ASCII alphanumerics, `-` and `_` so the name can
/// be used as a single path component.
pub(crate) fn sanitize(name: &str) -> String {
    let name: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect();

    if name.is_empty() {
        String::from("task")
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("SeqPos annotation"), "SeqPos_annotation");
        assert_eq!(sanitize("../etc"), "___etc");
        assert_eq!(sanitize(""), "task");
    }

    #[test]
    fn test_styles_build() {
        assert!(get_style_tree().is_some());
        assert!(get_style_task().is_some());
    }
}
