use serde::{Deserialize, Serialize};

/// A complete SMTP reply: the code of the final line and the joined
/// text of every line in the group.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Hash)]
pub struct Response {
    pub code: u16,
    pub enhanced_code: Option<EnhancedStatusCode>,
    #[serde(serialize_with = "as_single_line")]
    pub content: String,
    pub command: Option<String>,
}

impl Response {
    pub fn to_single_line(&self) -> String {
        let mut line = format!("{} ", self.code);

        if let Some(enh) = &self.enhanced_code {
            line.push_str(&format!("{}.{}.{} ", enh.class, enh.subject, enh.detail));
        }

        line.push_str(&remove_line_break(&self.content));

        line
    }

    pub fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    pub fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }
}

/// RFC 3463 `class.subject.detail` triple, when the server supplied one.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Hash)]
pub struct EnhancedStatusCode {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

/// One parsed line of a (possibly multi-line) reply.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ResponseLine<'a> {
    pub code: u16,
    pub is_final: bool,
    pub content: &'a str,
}

impl ResponseLine<'_> {
    fn to_raw(self) -> String {
        format!(
            "{}{}{}",
            self.code,
            if self.is_final { ' ' } else { '-' },
            self.content
        )
    }
}

/// Parse a single reply line. Returns the offending line text on failure.
pub fn parse_response_line(line: &str) -> Result<ResponseLine, String> {
    if line.len() < 4 {
        return Err(line.to_string());
    }

    match line.as_bytes()[3] {
        b' ' | b'-' => match line[0..3].parse::<u16>() {
            Ok(code) => Ok(ResponseLine {
                code,
                is_final: line.as_bytes()[3] == b' ',
                content: &line[4..],
            }),
            Err(_) => Err(line.to_string()),
        },
        _ => Err(line.to_string()),
    }
}

fn parse_enhanced(content: &str) -> Option<(EnhancedStatusCode, &str)> {
    let mut fields = content.splitn(2, ' ');
    let candidate = fields.next()?;
    let remainder = fields.next().unwrap_or("");

    let mut parts = candidate.split('.');
    let class = parts.next()?.parse::<u8>().ok()?;
    let subject = parts.next()?.parse::<u16>().ok()?;
    let detail = parts.next()?.parse::<u16>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    // Only 2.x.x, 4.x.x and 5.x.x classes are defined
    if !matches!(class, 2 | 4 | 5) {
        return None;
    }

    Some((
        EnhancedStatusCode {
            class,
            subject,
            detail,
        },
        remainder,
    ))
}

/// Accumulates the lines of a continued reply into a single Response.
/// The code is taken from the first line; every subsequent line must
/// repeat it. Enhanced status codes matching the first line's are
/// stripped from the joined content.
pub struct ResponseBuilder {
    code: u16,
    enhanced_code: Option<EnhancedStatusCode>,
    content: String,
}

impl ResponseBuilder {
    pub fn new(line: &ResponseLine) -> Self {
        let (enhanced_code, text) = match parse_enhanced(line.content) {
            Some((enh, rest)) => (Some(enh), rest),
            None => (None, line.content),
        };
        Self {
            code: line.code,
            enhanced_code,
            content: text.to_string(),
        }
    }

    pub fn add_line(&mut self, line: &ResponseLine) -> Result<(), String> {
        if line.code != self.code {
            return Err(line.to_raw());
        }

        let mut text = line.content;
        if let Some(first_enh) = &self.enhanced_code {
            if let Some((enh, rest)) = parse_enhanced(line.content) {
                if enh == *first_enh {
                    text = rest;
                }
            }
        }

        self.content.push('\n');
        self.content.push_str(text);
        Ok(())
    }

    pub fn build(self, command: Option<String>) -> Response {
        Response {
            code: self.code,
            enhanced_code: self.enhanced_code,
            content: self.content,
            command,
        }
    }
}

fn remove_line_break(line: &String) -> String {
    let mut new_line = String::new();
    let mut cr_to_space = false;

    for c in line.chars() {
        match c {
            '\r' => {
                new_line.push(' ');
                cr_to_space = true;
            }
            '\n' => {
                if !cr_to_space {
                    new_line.push(' ');
                } else {
                    cr_to_space = false;
                }
            }
            c => new_line.push(c),
        }
    }
    new_line
}

fn as_single_line<S>(content: &String, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&remove_line_break(content))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn response_line_parsing() {
        assert_eq!(
            parse_response_line("220 woot").unwrap(),
            ResponseLine {
                code: 220,
                is_final: true,
                content: "woot"
            }
        );
        assert_eq!(
            parse_response_line("220-woot").unwrap(),
            ResponseLine {
                code: 220,
                is_final: false,
                content: "woot"
            }
        );

        assert!(parse_response_line("220_woot").is_err());
        assert!(parse_response_line("not really").is_err());
        assert!(parse_response_line("22").is_err());
    }

    fn parse_multi_line(lines: &[&str]) -> Result<Response, String> {
        let mut parsed = parse_response_line(lines[0])?;
        let mut builder = ResponseBuilder::new(&parsed);
        for line in &lines[1..] {
            parsed = parse_response_line(line)?;
            builder.add_line(&parsed)?;
        }
        assert!(parsed.is_final);
        Ok(builder.build(None))
    }

    #[test]
    fn multi_line_response() {
        assert_eq!(
            parse_multi_line(&["220-woot", "220-more", "220 done"]).unwrap(),
            Response {
                code: 220,
                enhanced_code: None,
                content: "woot\nmore\ndone".to_string(),
                command: None
            }
        );

        let err = parse_multi_line(&["220-woot", "221-more", "220 done"]).unwrap_err();
        assert_eq!(err, "221-more");

        let err = parse_multi_line(&["220-woot", "220-more", "221 done"]).unwrap_err();
        assert_eq!(err, "221 done");
    }

    #[test]
    fn enhanced_codes() {
        assert_eq!(
            parse_multi_line(&["250-2.1.0 woot", "250-more", "250 done"]).unwrap(),
            Response {
                code: 250,
                enhanced_code: Some(EnhancedStatusCode {
                    class: 2,
                    subject: 1,
                    detail: 0
                }),
                content: "woot\nmore\ndone".to_string(),
                command: None
            }
        );

        // Matching per-line enhanced codes are stripped from the content
        assert_eq!(
            parse_multi_line(&["550-5.1.1 nope", "550 5.1.1 really"])
                .unwrap()
                .content,
            "nope\nreally"
        );

        // ... but only when they match the first line's code
        assert_eq!(
            parse_multi_line(&["550-5.1.1 nope", "550 5.7.1 really"])
                .unwrap()
                .content,
            "nope\n5.7.1 really"
        );
    }

    #[test]
    fn single_line_forms() {
        let resp = Response {
            code: 550,
            enhanced_code: Some(EnhancedStatusCode {
                class: 5,
                subject: 1,
                detail: 1
            }),
            content: "no such\nuser".to_string(),
            command: None,
        };
        assert_eq!(resp.to_single_line(), "550 5.1.1 no such user");
        assert!(resp.is_permanent());
        assert!(!resp.is_transient());
    }
}
