use regex::Regex;
use std::sync::LazyLock;

mod patterns;
mod verdict;

pub use patterns::PatternStore;
pub use verdict::{score, CheckDetails, Verdict};

/// Structural shape of an acceptable address: a restricted local part
/// at a dot-separated sequence of LDH labels.
static ADDRESS_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[A-Za-z0-9._+-]+@[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$",
    )
    .unwrap()
});

static PLUS_TAG_DENYLIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(test|spam|fake|dummy|temp)$").unwrap());

/// Providers that do not deliver plus-tagged addresses to the base
/// mailbox.
const PLUS_UNSUPPORTED_PROVIDERS: &[&str] = &[
    "aol.com",
    "yandex.com",
    "yandex.ru",
    "mail.ru",
    "protonmail.com",
    "proton.me",
    "zoho.com",
    "zohomail.com",
    "tutanota.com",
    "tutanota.de",
    "fastmail.com",
    "fastmail.fm",
];

const ROLE_ACCOUNTS: &[&str] = &[
    "abuse",
    "admin",
    "billing",
    "contact",
    "help",
    "hostmaster",
    "info",
    "jobs",
    "marketing",
    "no-reply",
    "noreply",
    "office",
    "postmaster",
    "sales",
    "security",
    "support",
    "team",
    "webmaster",
];

const KEYBOARD_WALKS: &[&str] = &[
    "qwerty",
    "asdfgh",
    "zxcvbn",
    "qwertyui",
    "asdfghjk",
    "zxcvbnm",
    "123456",
    "098765",
    "1234567890",
    "0987654321",
];

const MAX_ADDRESS_CHARS: usize = 250;
const MAX_LOCAL_OCTETS: usize = 64;
const MAX_DOMAIN_OCTETS: usize = 253;

/// The classifier either settles the address on its own or hands a
/// normalized form over for DNS and SMTP probing.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Verdict(Verdict),
    Probe {
        /// Original-case local part at the ASCII domain.
        email: String,
        domain: String,
        details: CheckDetails,
    },
}

/// Whether the address has the basic shape of an email address. This is
/// the cheap gate used before any cache or ruleset work happens.
pub fn is_well_formed(address: &str) -> bool {
    ADDRESS_SHAPE.is_match(address.trim())
}

/// Decide everything that can be decided from the address string alone.
///
/// Checks run in a fixed order and the first failure wins; an address
/// surviving all of them is handed on for MX and SMTP verification.
pub fn classify(input: &str, patterns: &PatternStore) -> Outcome {
    let trimmed = input.trim();
    let mut details = CheckDetails::default();

    if trimmed.chars().count() >= MAX_ADDRESS_CHARS {
        return reject(
            trimmed.to_lowercase(),
            score::MALFORMED,
            "Email address too long (250+ characters)".to_string(),
            details,
        );
    }

    // Split on the *last* @ and normalize the domain to ASCII before
    // any structural checks.
    let (email, check_addr, local, domain) = match trimmed.rsplit_once('@') {
        Some((local, domain)) => {
            if !local.is_ascii() {
                return reject(
                    trimmed.to_lowercase(),
                    score::MALFORMED,
                    "International characters not supported in local part".to_string(),
                    details,
                );
            }
            let ascii_domain = match idna::domain_to_ascii(domain) {
                Ok(d) if !d.is_empty() => d.to_lowercase(),
                _ => {
                    return reject(
                        trimmed.to_lowercase(),
                        score::MALFORMED,
                        "Invalid international domain name".to_string(),
                        details,
                    );
                }
            };
            let email = format!("{local}@{ascii_domain}");
            let check_addr = format!("{}@{ascii_domain}", local.to_ascii_lowercase());
            (email, check_addr, local.to_ascii_lowercase(), ascii_domain)
        }
        None => {
            let lower = trimmed.to_lowercase();
            (lower.clone(), lower.clone(), String::new(), String::new())
        }
    };

    if !ADDRESS_SHAPE.is_match(&check_addr) {
        return reject(
            check_addr,
            score::MALFORMED,
            "Invalid email format".to_string(),
            details,
        );
    }

    if check_addr.chars().any(is_restricted_char) {
        return reject(
            check_addr,
            score::MALFORMED,
            "Email contains invalid characters".to_string(),
            details,
        );
    }

    if local.len() > MAX_LOCAL_OCTETS {
        return reject(
            email,
            score::MALFORMED,
            "Local part exceeds 64 characters".to_string(),
            details,
        );
    }
    if local.starts_with('.') || local.ends_with('.') {
        return reject(
            email,
            score::MALFORMED,
            "Local part cannot begin or end with a dot".to_string(),
            details,
        );
    }
    if local.contains("..") {
        return reject(
            email,
            score::MALFORMED,
            "Local part cannot contain consecutive dots".to_string(),
            details,
        );
    }

    if domain.len() > MAX_DOMAIN_OCTETS {
        return reject(
            email,
            score::MALFORMED,
            "Domain exceeds 253 characters".to_string(),
            details,
        );
    }
    if domain.starts_with('-') || domain.ends_with('-') {
        return reject(
            email,
            score::MALFORMED,
            "Domain cannot begin or end with a hyphen".to_string(),
            details,
        );
    }
    if domain.contains("..") {
        return reject(
            email,
            score::MALFORMED,
            "Domain cannot contain empty labels".to_string(),
            details,
        );
    }

    details.format = true;

    if looks_suspicious(&local) {
        return reject(
            email,
            score::MALFORMED,
            "Email address appears to be randomly generated".to_string(),
            details,
        );
    }
    details.suspicious = true;

    if local.contains('+') {
        if let Some(reason) = plus_addressing_problem(&local, &domain) {
            return reject(email, score::MALFORMED, reason, details);
        }
    }

    details.role = !is_role_account(&local);

    if let Some(canonical) = patterns.typo_correction(&domain) {
        let mut verdict = Verdict::rejected(
            email,
            score::TYPO,
            format!("Domain appears to be a typo. Did you mean '{canonical}'?"),
            details,
        );
        verdict.suggestion = Some(canonical.to_string());
        return Outcome::Verdict(verdict);
    }
    details.typo = true;

    if patterns.is_disposable_domain(&domain) {
        return reject(
            email,
            score::DISPOSABLE,
            "Disposable email address".to_string(),
            details,
        );
    }
    details.disposable = true;

    if patterns.is_placeholder_domain(&domain) || is_spam_dominant(&local, &domain, patterns) {
        return reject(
            email,
            score::PLACEHOLDER,
            "Placeholder or example email detected".to_string(),
            details,
        );
    }
    details.spam_keywords = true;

    Outcome::Probe {
        email,
        domain,
        details,
    }
}

fn reject(email: String, score: u8, reason: String, details: CheckDetails) -> Outcome {
    Outcome::Verdict(Verdict::rejected(email, score, reason, details))
}

fn is_restricted_char(c: char) -> bool {
    c.is_whitespace()
        || matches!(
            c,
            '"' | '\'' | '!' | '#' | '$' | '%' | '&' | '*' | '/' | '=' | '?' | '^' | '`' | '{'
                | '|' | '}' | '~' | '(' | ')' | '<' | '>' | '[' | ']' | '\\'
        )
}

fn is_role_account(local: &str) -> bool {
    ROLE_ACCOUNTS.contains(&local)
}

fn looks_suspicious(local: &str) -> bool {
    let chars: Vec<char> = local.chars().collect();

    if chars.len() == 1 {
        return true;
    }

    // Five or more of the same character in a row
    let mut run = 1;
    for pair in chars.windows(2) {
        if pair[0] == pair[1] {
            run += 1;
            if run >= 5 {
                return true;
            }
        } else {
            run = 1;
        }
    }

    // The whole local part is one character repeated
    if chars.len() >= 3 && chars.iter().all(|&c| c == chars[0]) {
        return true;
    }

    // Four or more consecutive ascending codepoints, e.g. abcd or 1234
    let mut ascending = 1;
    for pair in chars.windows(2) {
        if (pair[1] as u32) == (pair[0] as u32) + 1 {
            ascending += 1;
            if ascending >= 4 {
                return true;
            }
        } else {
            ascending = 1;
        }
    }

    // Random-generated shapes only matter for longer local parts
    if chars.len() >= 8 {
        let mut unique: Vec<char> = chars.clone();
        unique.sort_unstable();
        unique.dedup();
        if (unique.len() as f64) / (chars.len() as f64) < 0.3 {
            return true;
        }

        for walk in KEYBOARD_WALKS {
            if local.contains(walk) {
                return true;
            }
            let reversed: String = walk.chars().rev().collect();
            if local.contains(&reversed) {
                return true;
            }
        }
    }

    false
}

fn plus_addressing_problem(local: &str, domain: &str) -> Option<String> {
    let parts: Vec<&str> = local.split('+').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Some("Invalid plus addressing format".to_string());
    }
    if PLUS_UNSUPPORTED_PROVIDERS.contains(&domain) {
        return Some(format!("Plus addressing is not supported by {domain}"));
    }
    if PLUS_TAG_DENYLIST.is_match(parts[1]) {
        return Some("Suspicious plus addressing tag".to_string());
    }
    None
}

fn is_spam_dominant(local: &str, domain: &str, patterns: &PatternStore) -> bool {
    if all_tokens_are_spam(local, patterns) {
        return true;
    }
    // The domain with its TLD stripped, e.g. spam-test.com -> spam-test
    match domain.rsplit_once('.') {
        Some((name, _tld)) if !name.is_empty() => all_tokens_are_spam(name, patterns),
        _ => false,
    }
}

fn all_tokens_are_spam(text: &str, patterns: &PatternStore) -> bool {
    let mut any = false;
    for token in text.split(['.', '_', '-']) {
        if token.is_empty() {
            continue;
        }
        if !patterns.is_spam_keyword(token) {
            return false;
        }
        any = true;
    }
    any
}

#[cfg(test)]
mod test {
    use super::*;

    fn patterns() -> PatternStore {
        PatternStore::default()
            .with_placeholder_domains(["example.com", "example.org", "test.invalid"])
            .with_spam_keywords(["test", "spam", "fake", "dummy", "temp", "asdf"])
            .with_typo_domain("gnail.com", "gmail.com")
            .with_typo_domain("gmial.com", "gmail.com")
            .with_disposable_domains(["mailinator.com", "guerrillamail.com"])
    }

    fn verdict(input: &str) -> Verdict {
        match classify(input, &patterns()) {
            Outcome::Verdict(v) => v,
            Outcome::Probe { email, .. } => panic!("{input} unexpectedly probed as {email}"),
        }
    }

    fn probe(input: &str) -> (String, String, CheckDetails) {
        match classify(input, &patterns()) {
            Outcome::Probe {
                email,
                domain,
                details,
            } => (email, domain, details),
            Outcome::Verdict(v) => panic!("{input} unexpectedly rejected: {:?}", v.reason),
        }
    }

    #[test]
    fn clean_address_is_probed() {
        let (email, domain, details) = probe("John.Doe@Gmail.com");
        assert_eq!(email, "John.Doe@gmail.com");
        assert_eq!(domain, "gmail.com");
        assert!(details.format);
        assert!(details.typo);
        assert!(details.disposable);
        assert!(details.suspicious);
        assert!(details.spam_keywords);
        assert!(details.role);
        assert!(!details.mx, "mx is not decided lexically");
    }

    #[test]
    fn length_guard_boundary() {
        // local of 237 + "@" + "example.net" (11) = 249 chars: passes the
        // guard (then fails the local-part length rule instead)
        let local = "a".repeat(237);
        let at_249 = format!("{local}@example.net");
        assert_eq!(at_249.chars().count(), 249);
        let v = verdict(&at_249);
        assert_ne!(v.reason[0], "Email address too long (250+ characters)");

        let local = "a".repeat(238);
        let at_250 = format!("{local}@example.net");
        assert_eq!(at_250.chars().count(), 250);
        let v = verdict(&at_250);
        assert_eq!(v.score, score::MALFORMED);
        assert_eq!(v.reason, vec!["Email address too long (250+ characters)"]);
    }

    #[test]
    fn idn_domain_is_punycoded() {
        let (email, domain, _) = probe("info2@bücher.de");
        assert_eq!(domain, "xn--bcher-kva.de");
        assert_eq!(email, "info2@xn--bcher-kva.de");
    }

    #[test]
    fn unicode_local_part_is_rejected() {
        let v = verdict("jösé@example.net");
        assert_eq!(v.score, score::MALFORMED);
        assert_eq!(
            v.reason,
            vec!["International characters not supported in local part"]
        );
    }

    #[test]
    fn structural_failures() {
        for bad in [
            "not-an-email",
            "a@",
            "@example.com",
            "a@b..co",
            "a@-b.co",
            "a@b-.co",
            "two@@example.com",
        ] {
            let v = verdict(bad);
            assert_eq!(v.score, score::MALFORMED, "{bad}");
            assert!(!v.valid, "{bad}");
        }
        let (email, _, _) = probe("ab@b.co");
        assert_eq!(email, "ab@b.co");
    }

    // Enough distinct characters to stay clear of the randomness
    // heuristics, no ascending codepoint runs
    fn long_local(len: usize) -> String {
        "a0b1c2d3e4f5g6h7i8j9".chars().cycle().take(len).collect()
    }

    #[test]
    fn local_part_length_boundary() {
        let local = long_local(64);
        assert_eq!(local.len(), 64);
        probe(&format!("{local}@realmail.net"));

        let local = long_local(65);
        let v = verdict(&format!("{local}@realmail.net"));
        assert_eq!(v.reason, vec!["Local part exceeds 64 characters"]);
    }

    #[test]
    fn domain_length_boundary() {
        // 63 + 1 + 63 + 1 + 63 + 1 + 61 = 253 octets
        let label = "d".repeat(63);
        let domain_253 = format!("{label}.{label}.{label}.{}", "d".repeat(61));
        assert_eq!(domain_253.len(), 253);
        probe(&format!("user2@{domain_253}"));

        let domain_254 = format!("{label}.{label}.{label}.{}", "d".repeat(62));
        assert_eq!(domain_254.len(), 254);
        let v = verdict(&format!("user2@{domain_254}"));
        assert_eq!(v.reason, vec!["Domain exceeds 253 characters"]);
    }

    #[test]
    fn dotted_local_rules() {
        let v = verdict(".user@realmail.net");
        assert_eq!(v.reason, vec!["Local part cannot begin or end with a dot"]);
        let v = verdict("user.@realmail.net");
        assert_eq!(v.reason, vec!["Local part cannot begin or end with a dot"]);
        let v = verdict("us..er@realmail.net");
        assert_eq!(v.reason, vec!["Local part cannot contain consecutive dots"]);
    }

    #[test]
    fn suspicious_local_parts() {
        for bad in [
            "x@realmail.net",          // single character
            "aaaaab@realmail.net",     // five identical in a row
            "bbb@realmail.net",        // entire local repeated
            "abcd99@realmail.net",     // ascending run
            "user1234@realmail.net",   // ascending run inside
            "aabbaabbaabb@realmail.net", // low unique ratio at length >= 8
            "qwertyuiop@realmail.net", // keyboard walk at length >= 8
            "ytrewq0987@realmail.net", // reversed walk
        ] {
            let v = verdict(bad);
            assert_eq!(
                v.reason,
                vec!["Email address appears to be randomly generated"],
                "{bad}"
            );
            assert_eq!(v.score, score::MALFORMED, "{bad}");
        }

        // Short walk-looking locals are not suspicious by themselves
        probe("qwerty@realmail.net");
        probe("ab@realmail.net");
    }

    #[test]
    fn plus_addressing() {
        probe("user+tag@gmail.com");

        let v = verdict("user+test@gmail.com");
        assert_eq!(v.reason, vec!["Suspicious plus addressing tag"]);

        let v = verdict("user+tag@aol.com");
        assert_eq!(v.reason, vec!["Plus addressing is not supported by aol.com"]);

        let v = verdict("user+a+b@gmail.com");
        assert_eq!(v.reason, vec!["Invalid plus addressing format"]);

        let v = verdict("user+@gmail.com");
        assert_eq!(v.reason, vec!["Invalid plus addressing format"]);
    }

    #[test]
    fn typo_domain_suggestion() {
        let v = verdict("foo@gnail.com");
        assert!(!v.valid);
        assert_eq!(v.score, score::TYPO);
        assert_eq!(v.suggestion.as_deref(), Some("gmail.com"));
        assert_eq!(
            v.reason,
            vec!["Domain appears to be a typo. Did you mean 'gmail.com'?"]
        );
        assert!(v.details.format);
        assert!(!v.details.typo);
    }

    #[test]
    fn disposable_domain() {
        let v = verdict("user@mailinator.com");
        assert_eq!(v.score, score::DISPOSABLE);
        assert_eq!(v.reason, vec!["Disposable email address"]);
        assert!(v.details.typo);
        assert!(!v.details.disposable);
    }

    #[test]
    fn placeholder_and_spam_dominance() {
        let v = verdict("qwerty@example.com");
        assert_eq!(v.score, score::PLACEHOLDER);
        assert_eq!(v.reason, vec!["Placeholder or example email detected"]);

        // Every local token is a spam keyword
        let v = verdict("test.spam_fake@realmail.net");
        assert_eq!(v.score, score::PLACEHOLDER);

        // Domain minus TLD is spam-keyword dominated
        let v = verdict("someone@spam-test.net");
        assert_eq!(v.score, score::PLACEHOLDER);

        // One non-spam token saves it
        probe("test.actual@realmail.net");
    }

    #[test]
    fn role_accounts_are_flagged_not_rejected() {
        let (_, _, details) = probe("postmaster@realmail.net");
        assert!(!details.role);
        let (_, _, details) = probe("someone2@realmail.net");
        assert!(details.role);
    }

    #[test]
    fn case_insensitive_equivalence() {
        let a = classify("User.Name@REALMAIL.net", &patterns());
        let b = classify("user.name@realmail.net", &patterns());
        match (a, b) {
            (
                Outcome::Probe {
                    email: ea,
                    domain: da,
                    details: xa,
                },
                Outcome::Probe {
                    email: eb,
                    domain: db,
                    details: xb,
                },
            ) => {
                assert_eq!(ea, "User.Name@realmail.net");
                assert_eq!(eb, "user.name@realmail.net");
                assert_eq!(da, db);
                assert_eq!(xa, xb);
            }
            wat => panic!("unexpected outcomes {wat:?}"),
        }
    }

    #[test]
    fn well_formed_gate() {
        assert!(is_well_formed("ab@b.co"));
        assert!(is_well_formed("  ab@b.co  "));
        assert!(!is_well_formed("a@b..co"));
        assert!(!is_well_formed("nope"));
    }
}
