//! Prompt recognition for network device shells.
//!
//! A [`PromptProfile`] describes one device family: the regexes that identify
//! its prompts, pager and error lines, plus the housekeeping commands a
//! session sends (escalation, paging, exit). [`PromptMatcher`] compiles a
//! profile into a single `RegexSet` and classifies shell output line by line.

use log::trace;
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};

use crate::error::ConfigError;

/// Privilege level implied by a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptLevel {
    /// `host>`
    User,
    /// `host#`
    Privileged,
    /// `host(config)#`
    Config,
}

impl PromptLevel {
    pub fn is_privileged(self) -> bool {
        matches!(self, PromptLevel::Privileged | PromptLevel::Config)
    }
}

/// Classification of one line (or the unterminated tail) of shell output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    Output,
    /// Pager prompt waiting for a keypress.
    More,
    /// Device error message.
    Error,
    /// Password prompt, e.g. after `enable`.
    Password,
    Prompt(PromptLevel),
}

/// Patterns and commands of one device family.
#[derive(Debug, Clone)]
pub struct PromptProfile {
    pub name: String,
    /// Prompt regexes in match priority order.
    pub prompts: Vec<(PromptLevel, String)>,
    pub password_prompts: Vec<String>,
    pub more_patterns: Vec<String>,
    pub error_patterns: Vec<String>,
    pub escalate_command: String,
    pub paging_disable_command: String,
    /// Sent while finalizing when paging was suppressed.
    pub paging_restore_command: Option<String>,
    pub exit_command: String,
}

impl PromptProfile {
    /// Cisco IOS / IOS-XE.
    pub fn cisco_ios() -> Self {
        Self {
            name: "cisco_ios".to_string(),
            prompts: vec![
                (PromptLevel::Config, r"^\S+\(\S+\)#\s*$".to_string()),
                (PromptLevel::Privileged, r"^[^\s#>]+#\s*$".to_string()),
                (PromptLevel::User, r"^[^\s#>]+>\s*$".to_string()),
            ],
            password_prompts: vec![r"(?i)^(enable )?password:\s*$".to_string()],
            more_patterns: vec![
                r"\s*-+\s*More\s*-+\s*".to_string(),
                r"\s*<--- More --->\s*".to_string(),
            ],
            error_patterns: vec![
                r"^%.+".to_string(),
                r"^Command authorization failed.*".to_string(),
                r"^Command rejected:.*".to_string(),
                r"ERROR:.+".to_string(),
                r"Invalid password".to_string(),
                r"Access denied".to_string(),
                r"Bad secrets".to_string(),
            ],
            escalate_command: "enable".to_string(),
            paging_disable_command: "terminal length 0".to_string(),
            paging_restore_command: Some("terminal length 24".to_string()),
            exit_command: "exit".to_string(),
        }
    }

    /// Compiles the profile.
    pub fn matcher(&self) -> Result<PromptMatcher, ConfigError> {
        PromptMatcher::new(self)
    }
}

impl Default for PromptProfile {
    fn default() -> Self {
        Self::cisco_ios()
    }
}

/// Compiled form of a [`PromptProfile`].
#[derive(Debug, Clone)]
pub struct PromptMatcher {
    all_regex: RegexSet,
    /// Class of each regex in `all_regex`, by index.
    classes: Vec<LineClass>,
    more: RegexSet,
    more_strip: Vec<Regex>,
}

impl PromptMatcher {
    pub fn new(profile: &PromptProfile) -> Result<Self, ConfigError> {
        let mut regexs: Vec<String> = Vec::new();
        let mut classes = Vec::new();

        for pattern in &profile.more_patterns {
            regexs.push(pattern.clone());
            classes.push(LineClass::More);
        }
        for pattern in &profile.error_patterns {
            regexs.push(pattern.clone());
            classes.push(LineClass::Error);
        }
        for (level, pattern) in &profile.prompts {
            // Leading NULs and a lone carriage return precede prompts on some
            // terminals.
            regexs.push(format!(
                r"^\x00*\r{{0,1}}{}",
                pattern.trim_start_matches('^')
            ));
            classes.push(LineClass::Prompt(*level));
        }
        for pattern in &profile.password_prompts {
            regexs.push(pattern.clone());
            classes.push(LineClass::Password);
        }

        let all_regex = RegexSet::new(&regexs).map_err(|err| {
            ConfigError::InvalidProfile(format!(
                "failed to build regex set for '{}': {err}",
                profile.name
            ))
        })?;
        let more = RegexSet::new(&profile.more_patterns)
            .map_err(|err| ConfigError::InvalidProfile(format!("invalid pager regex: {err}")))?;
        let more_strip = profile
            .more_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| ConfigError::InvalidProfile(format!("invalid pager regex: {err}")))?;

        Ok(Self {
            all_regex,
            classes,
            more,
            more_strip,
        })
    }

    /// Classifies a line. The first matching pattern wins.
    pub fn classify(&self, line: &str) -> LineClass {
        let class = self
            .all_regex
            .matches(line)
            .into_iter()
            .next()
            .and_then(|index| self.classes.get(index).copied())
            .unwrap_or(LineClass::Output);
        trace!("Classified {:?} as {:?}", line, class);
        class
    }

    /// Returns the prompt level if `line` is a prompt.
    pub fn prompt_level(&self, line: &str) -> Option<PromptLevel> {
        match self.classify(line) {
            LineClass::Prompt(level) => Some(level),
            _ => None,
        }
    }

    /// True if the text contains a pager prompt anywhere.
    pub fn has_more(&self, text: &str) -> bool {
        self.more.is_match(text)
    }

    /// Removes pager prompts from `text`.
    pub fn strip_more(&self, text: &str) -> String {
        let mut out = text.to_string();
        for re in &self.more_strip {
            out = re.replace_all(&out, "").into_owned();
        }
        out
    }
}

/// Leading carriage-return and backspace runs emitted by terminal redraws.
pub static IGNORE_START_LINE: Lazy<Regex> =
    Lazy::new(
        || match Regex::new(r"^(\r+(\s+\r+)*)|(\u{8}+(\s+\u{8}+)*)") {
            Ok(re) => re,
            Err(err) => panic!("invalid IGNORE_START_LINE regex: {err}"),
        },
    );

/// Strips terminal noise from a raw line and drops the line terminator.
pub fn clean_line(raw: &str) -> String {
    let trimmed = IGNORE_START_LINE.replace(raw, "");
    trimmed.trim_end_matches(['\r', '\n']).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> PromptMatcher {
        PromptProfile::cisco_ios()
            .matcher()
            .expect("cisco profile should compile")
    }

    #[test]
    fn prompts_are_classified_by_level() {
        let m = matcher();
        assert_eq!(m.prompt_level("R1>"), Some(PromptLevel::User));
        assert_eq!(m.prompt_level("R1#"), Some(PromptLevel::Privileged));
        assert_eq!(m.prompt_level("R1(config-if)#"), Some(PromptLevel::Config));
        assert_eq!(m.prompt_level("\rcore-sw1# "), Some(PromptLevel::Privileged));
        assert_eq!(m.prompt_level("R1#show version"), None);
    }

    #[test]
    fn password_and_error_lines_are_detected() {
        let m = matcher();
        assert_eq!(m.classify("Password: "), LineClass::Password);
        assert_eq!(m.classify("Enable Password:"), LineClass::Password);
        assert_eq!(m.classify("% Access denied"), LineClass::Error);
        assert_eq!(m.classify("% Invalid input detected at '^' marker."), LineClass::Error);
        assert_eq!(m.classify("GigabitEthernet0/1 up up"), LineClass::Output);
    }

    #[test]
    fn pager_prompt_is_detected_and_stripped() {
        let m = matcher();
        assert!(m.has_more(" --More-- "));
        assert_eq!(m.classify(" --More-- "), LineClass::More);
        assert_eq!(m.strip_more("line one --More-- "), "line one");
        assert!(!m.has_more("show running-config"));
    }

    #[test]
    fn invalid_profile_regex_returns_config_error() {
        let mut profile = PromptProfile::cisco_ios();
        profile.error_patterns.push("(".to_string());
        let err = profile.matcher().expect_err("invalid regex");
        assert!(matches!(err, ConfigError::InvalidProfile(_)));
    }

    #[test]
    fn clean_line_drops_redraw_noise() {
        assert_eq!(clean_line("\r\rInterface status\r\n"), "Interface status");
        assert_eq!(clean_line("plain\n"), "plain");
    }
}
