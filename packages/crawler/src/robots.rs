//! Minimal robots.txt handling.
//!
//! Parses the subset of robots.txt the pipeline acts on: `Disallow` /
//! `Allow` prefixes and `Crawl-delay`, for the wildcard agent and for our
//! own user-agent. Directives for other agents are ignored. The parsed
//! document is cached per host in `host_states` and refreshed when older
//! than the host's `robots_ttl_hours`.

/// Parsed robots directives applicable to one user-agent.
#[derive(Debug, Clone, Default)]
pub struct RobotsRules {
    allow: Vec<String>,
    disallow: Vec<String>,
    crawl_delay_ms: Option<i32>,
}

impl RobotsRules {
    /// Parse a robots.txt body, keeping the groups that apply to
    /// `user_agent` (longest agent match wins; `*` applies when no specific
    /// group matches).
    pub fn parse(body: &str, user_agent: &str) -> Self {
        let agent = user_agent.to_ascii_lowercase();

        let mut wildcard = RobotsRules::default();
        let mut specific = RobotsRules::default();
        let mut saw_specific = false;

        // Group state: which of the current group's agents match us.
        let mut group_wildcard = false;
        let mut group_specific = false;
        let mut in_agent_list = false;

        for raw_line in body.lines() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            let Some((field, value)) = line.split_once(':') else {
                continue;
            };
            let field = field.trim().to_ascii_lowercase();
            let value = value.trim();

            match field.as_str() {
                "user-agent" => {
                    // A new agent line after directives starts a new group.
                    if !in_agent_list {
                        group_wildcard = false;
                        group_specific = false;
                    }
                    in_agent_list = true;
                    let value = value.to_ascii_lowercase();
                    if value == "*" {
                        group_wildcard = true;
                    } else if agent.contains(&value) {
                        group_specific = true;
                        saw_specific = true;
                    }
                }
                "disallow" => {
                    in_agent_list = false;
                    if value.is_empty() {
                        continue;
                    }
                    if group_specific {
                        specific.disallow.push(value.to_string());
                    }
                    if group_wildcard {
                        wildcard.disallow.push(value.to_string());
                    }
                }
                "allow" => {
                    in_agent_list = false;
                    if value.is_empty() {
                        continue;
                    }
                    if group_specific {
                        specific.allow.push(value.to_string());
                    }
                    if group_wildcard {
                        wildcard.allow.push(value.to_string());
                    }
                }
                "crawl-delay" => {
                    in_agent_list = false;
                    if let Ok(secs) = value.parse::<f64>() {
                        let ms = (secs * 1000.0) as i32;
                        if group_specific {
                            specific.crawl_delay_ms = Some(ms);
                        }
                        if group_wildcard {
                            wildcard.crawl_delay_ms = Some(ms);
                        }
                    }
                }
                _ => {
                    in_agent_list = false;
                }
            }
        }

        if saw_specific {
            specific
        } else {
            wildcard
        }
    }

    /// Whether fetching `path` is permitted. The most specific (longest)
    /// matching rule wins; `Allow` beats `Disallow` at equal length.
    pub fn is_allowed(&self, path: &str) -> bool {
        let path = if path.is_empty() { "/" } else { path };

        let allow_len = self
            .allow
            .iter()
            .filter(|p| path.starts_with(p.as_str()))
            .map(|p| p.len())
            .max();
        let disallow_len = self
            .disallow
            .iter()
            .filter(|p| path.starts_with(p.as_str()))
            .map(|p| p.len())
            .max();

        match (allow_len, disallow_len) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(a), Some(d)) => a >= d,
        }
    }

    /// Advertised crawl delay, if any.
    pub fn crawl_delay_ms(&self) -> Option<i32> {
        self.crawl_delay_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = "\
# comments are ignored
User-agent: *
Disallow: /private/
Disallow: /tmp/
Allow: /private/press/
Crawl-delay: 2

User-agent: otherbot
Disallow: /
";

    #[test]
    fn wildcard_group_applies() {
        let rules = RobotsRules::parse(BODY, "contentpipeline/1.0");
        assert!(rules.is_allowed("/news/story"));
        assert!(!rules.is_allowed("/private/report"));
        assert!(!rules.is_allowed("/tmp/x"));
        assert_eq!(rules.crawl_delay_ms(), Some(2000));
    }

    #[test]
    fn allow_overrides_disallow_when_more_specific() {
        let rules = RobotsRules::parse(BODY, "contentpipeline/1.0");
        assert!(rules.is_allowed("/private/press/release"));
    }

    #[test]
    fn specific_group_shadows_wildcard() {
        let rules = RobotsRules::parse(BODY, "otherbot/2.1");
        assert!(!rules.is_allowed("/news/story"));
        assert!(!rules.is_allowed("/"));
    }

    #[test]
    fn empty_body_allows_everything() {
        let rules = RobotsRules::parse("", "contentpipeline/1.0");
        assert!(rules.is_allowed("/anything"));
        assert_eq!(rules.crawl_delay_ms(), None);
    }

    #[test]
    fn empty_disallow_means_allow_all() {
        let rules = RobotsRules::parse("User-agent: *\nDisallow:\n", "contentpipeline/1.0");
        assert!(rules.is_allowed("/a/b"));
    }

    #[test]
    fn grouped_agent_lists_share_directives() {
        let body = "User-agent: a\nUser-agent: *\nDisallow: /x/\n";
        let rules = RobotsRules::parse(body, "contentpipeline/1.0");
        assert!(!rules.is_allowed("/x/page"));
    }
}
