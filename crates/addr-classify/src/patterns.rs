use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Static rulesets consulted by the classifier: placeholder domains,
/// spam keywords, typo→canonical domain corrections and disposable
/// domains. Immutable after load; concurrent reads need no locking.
///
/// Each ruleset comes from one plain-text file: one token per line,
/// blank lines and `#` comments ignored. `typo_domains.txt` uses
/// `bad:canonical` lines. A missing file degrades to an empty set with
/// a warning; it is never an error.
#[derive(Debug, Default)]
pub struct PatternStore {
    placeholder_domains: HashSet<String>,
    spam_keywords: HashSet<String>,
    typo_domains: HashMap<String, String>,
    disposable_domains: HashSet<String>,
}

impl PatternStore {
    pub fn load(dir: &Path) -> Self {
        let mut store = Self::default();
        store.placeholder_domains = load_tokens(&dir.join("placeholder_domains.txt"));
        store.spam_keywords = load_tokens(&dir.join("spam_keywords.txt"));
        store.disposable_domains = load_tokens(&dir.join("disposable_domains.txt"));

        for token in load_tokens(&dir.join("typo_domains.txt")) {
            match token.split_once(':') {
                Some((bad, canonical)) if !bad.is_empty() && !canonical.is_empty() => {
                    store
                        .typo_domains
                        .insert(bad.to_string(), canonical.to_string());
                }
                _ => {
                    tracing::warn!("ignoring malformed typo_domains line: {token}");
                }
            }
        }

        tracing::debug!(
            "loaded patterns: {} placeholder domains, {} spam keywords, \
             {} typo corrections, {} disposable domains",
            store.placeholder_domains.len(),
            store.spam_keywords.len(),
            store.typo_domains.len(),
            store.disposable_domains.len(),
        );
        store
    }

    pub fn is_placeholder_domain(&self, domain: &str) -> bool {
        self.placeholder_domains.contains(domain)
    }

    pub fn is_spam_keyword(&self, token: &str) -> bool {
        self.spam_keywords.contains(token)
    }

    pub fn typo_correction(&self, domain: &str) -> Option<&str> {
        self.typo_domains.get(domain).map(|s| s.as_str())
    }

    pub fn is_disposable_domain(&self, domain: &str) -> bool {
        self.disposable_domains.contains(domain)
    }

    pub fn with_placeholder_domains<I: IntoIterator<Item = S>, S: Into<String>>(
        mut self,
        domains: I,
    ) -> Self {
        self.placeholder_domains
            .extend(domains.into_iter().map(|d| d.into().to_lowercase()));
        self
    }

    pub fn with_spam_keywords<I: IntoIterator<Item = S>, S: Into<String>>(
        mut self,
        keywords: I,
    ) -> Self {
        self.spam_keywords
            .extend(keywords.into_iter().map(|k| k.into().to_lowercase()));
        self
    }

    pub fn with_typo_domain(mut self, bad: &str, canonical: &str) -> Self {
        self.typo_domains
            .insert(bad.to_lowercase(), canonical.to_lowercase());
        self
    }

    pub fn with_disposable_domains<I: IntoIterator<Item = S>, S: Into<String>>(
        mut self,
        domains: I,
    ) -> Self {
        self.disposable_domains
            .extend(domains.into_iter().map(|d| d.into().to_lowercase()));
        self
    }
}

fn load_tokens(path: &Path) -> HashSet<String> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) => {
            tracing::warn!(
                "pattern file {} not readable ({err}); continuing with an empty set",
                path.display()
            );
            return HashSet::new();
        }
    };

    data.lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.to_lowercase())
        .collect()
}
