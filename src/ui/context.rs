//! Terminal detection

use std::io::IsTerminal;

/// Environment variables set by common CI systems
const CI_VARS: [&str; 5] = ["CI", "GITHUB_ACTIONS", "GITLAB_CI", "BUILDKITE", "JENKINS_URL"];

/// Whether output goes to a person or to a pipe
#[derive(Debug, Clone, Copy)]
pub struct UiContext {
    fancy: bool,
}

impl UiContext {
    /// Fancy output only on an interactive terminal outside CI
    pub fn detect() -> Self {
        let terminal = std::io::stdout().is_terminal();
        let ci = CI_VARS.iter().any(|v| std::env::var_os(v).is_some());
        Self {
            fancy: terminal && !ci,
        }
    }

    /// Plain output regardless of the terminal
    pub fn plain() -> Self {
        Self { fancy: false }
    }

    pub fn use_fancy_output(&self) -> bool {
        self.fancy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_context_is_not_fancy() {
        assert!(!UiContext::plain().use_fancy_output());
    }
}
