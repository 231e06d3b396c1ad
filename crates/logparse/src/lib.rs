//! Positional access-log parsing.
//!
//! A format template names the fields by position, using the same tokenizer
//! as the log lines themselves: whitespace-separated tokens, with `[...]`
//! and `"..."` grouping. The default template is the combined log format; a
//! template ending in a quoted `$proxy_addr` selects the proxied client
//! address instead of the first token.

use chrono::{DateTime, Utc};
use cidrwatch_common::{CidrwatchError, Method, Request};
use cidrwatch_net::parse_addr;

const TIME_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

/// A compiled positional log format.
#[derive(Debug, Clone)]
pub struct LogFormat {
    token_count: usize,
    remote_addr: usize,
    time_local: usize,
    request: Option<usize>,
    status: Option<usize>,
    bytes: Option<usize>,
    user_agent: Option<usize>,
    /// Set when the template ends in a quoted proxied address.
    proxy_addr: Option<usize>,
}

impl LogFormat {
    /// Compile a template such as
    /// `$remote_addr - - [$time_local] "$request" $status $bytes
    /// "$http_referer" "$http_user_agent"`.
    pub fn from_template(template: &str) -> Result<Self, CidrwatchError> {
        let tokens = tokenize(template);
        if tokens.is_empty() {
            return Err(CidrwatchError::LogFormat("empty template".to_string()));
        }

        let mut format = Self {
            token_count: tokens.len(),
            remote_addr: usize::MAX,
            time_local: usize::MAX,
            request: None,
            status: None,
            bytes: None,
            user_agent: None,
            proxy_addr: None,
        };

        for (index, token) in tokens.iter().enumerate() {
            match *token {
                "$remote_addr" => format.remote_addr = index,
                "$time_local" => format.time_local = index,
                "$request" => format.request = Some(index),
                "$status" => format.status = Some(index),
                "$bytes" | "$body_bytes_sent" => format.bytes = Some(index),
                "$http_user_agent" => format.user_agent = Some(index),
                "$http_referer" => {} // recognized, not retained
                "$proxy_addr" => format.proxy_addr = Some(index),
                other if other.starts_with('$') => {
                    return Err(CidrwatchError::LogFormat(format!(
                        "unknown placeholder {}",
                        other
                    )));
                }
                _ => {} // positional literal, skipped
            }
        }

        if format.remote_addr == usize::MAX {
            return Err(CidrwatchError::LogFormat(
                "template lacks $remote_addr".to_string(),
            ));
        }
        if format.time_local == usize::MAX {
            return Err(CidrwatchError::LogFormat(
                "template lacks $time_local".to_string(),
            ));
        }
        if let Some(proxy) = format.proxy_addr {
            if proxy != tokens.len() - 1 {
                return Err(CidrwatchError::LogFormat(
                    "$proxy_addr must be the terminal token".to_string(),
                ));
            }
        }

        Ok(format)
    }

    /// Parse one log line into a [`Request`].
    pub fn parse(&self, line: &str) -> Result<Request, CidrwatchError> {
        let tokens = tokenize(line);
        if tokens.len() < self.token_count {
            return Err(CidrwatchError::LogLine(format!(
                "expected {} tokens, found {}",
                self.token_count,
                tokens.len()
            )));
        }

        // Proxied logs carry the client behind the proxy as the terminal
        // quoted token; a bare "-" there means no proxy was involved and the
        // primary address is used instead.
        let addr_token = match self.proxy_addr {
            Some(index) if tokens[index] != "-" => tokens[index],
            _ => tokens[self.remote_addr],
        };
        let addr = parse_addr(addr_token)
            .map_err(|_| CidrwatchError::LogLine(format!("bad address '{}'", addr_token)))?;

        let time_token = tokens[self.time_local];
        let timestamp = DateTime::parse_from_str(time_token, TIME_FORMAT)
            .map_err(|_| CidrwatchError::LogLine(format!("bad timestamp '{}'", time_token)))?
            .with_timezone(&Utc);

        let (method, uri) = match self.request {
            Some(index) => split_request(tokens[index]),
            None => (Method::Unknown, String::new()),
        };

        let status = match self.status {
            Some(index) => numeric_or_zero::<u16>(tokens[index]),
            None => 0,
        };
        let bytes = match self.bytes {
            Some(index) => numeric_or_zero::<u32>(tokens[index]),
            None => 0,
        };
        let user_agent = self
            .user_agent
            .map(|index| tokens[index].to_string())
            .unwrap_or_default();

        Ok(Request {
            addr,
            timestamp,
            method,
            status,
            bytes,
            uri,
            user_agent,
        })
    }
}

impl Default for LogFormat {
    fn default() -> Self {
        Self::from_template(
            "$remote_addr - - [$time_local] \"$request\" $status $bytes \"$http_referer\" \"$http_user_agent\"",
        )
        .expect("default template compiles")
    }
}

/// Split the `"METHOD URI PROTO"` token.
fn split_request(token: &str) -> (Method, String) {
    let mut parts = token.split_whitespace();
    let method = parts.next().map(Method::parse).unwrap_or(Method::Unknown);
    let uri = parts.next().unwrap_or("").to_string();
    (method, uri)
}

/// `-` and unparseable numerics count as zero; the record is still usable.
fn numeric_or_zero<T: std::str::FromStr + Default>(token: &str) -> T {
    token.parse().unwrap_or_default()
}

/// Split a line into positional tokens. `[...]` and `"..."` group into one
/// token each, delimiters stripped.
fn tokenize(line: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let bytes = line.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' => i += 1,
            b'[' => {
                let start = i + 1;
                let end = line[start..].find(']').map(|o| start + o).unwrap_or(bytes.len());
                tokens.push(&line[start..end]);
                i = end + 1;
            }
            b'"' => {
                let start = i + 1;
                let end = line[start..].find('"').map(|o| start + o).unwrap_or(bytes.len());
                tokens.push(&line[start..end]);
                i = end + 1;
            }
            _ => {
                let start = i;
                while i < bytes.len() && bytes[i] != b' ' && bytes[i] != b'\t' {
                    i += 1;
                }
                tokens.push(&line[start..i]);
            }
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use cidrwatch_net::render_addr;

    const LINE: &str = "203.0.113.9 - - [01/Jun/2025:12:30:45 +0200] \"GET /index.html HTTP/1.1\" 200 5316 \"https://example.com/\" \"Mozilla/5.0 (X11; Linux x86_64)\"";

    #[test]
    fn tokenizer_groups_brackets_and_quotes() {
        let tokens = tokenize(LINE);
        assert_eq!(tokens[0], "203.0.113.9");
        assert_eq!(tokens[3], "01/Jun/2025:12:30:45 +0200");
        assert_eq!(tokens[4], "GET /index.html HTTP/1.1");
        assert_eq!(tokens[7], "https://example.com/");
        assert_eq!(tokens[8], "Mozilla/5.0 (X11; Linux x86_64)");
        assert_eq!(tokens.len(), 9);
    }

    #[test]
    fn default_format_parses_combined_line() {
        let format = LogFormat::default();
        let request = format.parse(LINE).unwrap();

        assert_eq!(render_addr(request.addr), "203.0.113.9");
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.uri, "/index.html");
        assert_eq!(request.status, 200);
        assert_eq!(request.bytes, 5316);
        assert_eq!(request.user_agent, "Mozilla/5.0 (X11; Linux x86_64)");
        // 12:30:45 +0200 is 10:30:45 UTC.
        assert_eq!(
            request.timestamp,
            Utc.with_ymd_and_hms(2025, 6, 1, 10, 30, 45).unwrap()
        );
    }

    #[test]
    fn proxied_template_prefers_terminal_address() {
        let format = LogFormat::from_template(
            "$remote_addr - - [$time_local] \"$request\" $status $bytes \"$http_referer\" \"$http_user_agent\" \"$proxy_addr\"",
        )
        .unwrap();

        let line = format!("{} \"198.51.100.7\"", LINE);
        let request = format.parse(&line).unwrap();
        assert_eq!(render_addr(request.addr), "198.51.100.7");
    }

    #[test]
    fn proxied_template_dash_falls_back_to_primary() {
        let format = LogFormat::from_template(
            "$remote_addr - - [$time_local] \"$request\" $status $bytes \"$http_referer\" \"$http_user_agent\" \"$proxy_addr\"",
        )
        .unwrap();

        let line = format!("{} \"-\"", LINE);
        let request = format.parse(&line).unwrap();
        assert_eq!(render_addr(request.addr), "203.0.113.9");
    }

    #[test]
    fn short_line_is_malformed() {
        let format = LogFormat::default();
        let err = format.parse("203.0.113.9 - -").unwrap_err();
        assert!(matches!(err, CidrwatchError::LogLine(_)));
    }

    #[test]
    fn bad_address_is_malformed() {
        let format = LogFormat::default();
        let line = LINE.replace("203.0.113.9", "not-an-address");
        assert!(matches!(
            format.parse(&line),
            Err(CidrwatchError::LogLine(_))
        ));
    }

    #[test]
    fn bad_timestamp_is_malformed() {
        let format = LogFormat::default();
        let line = LINE.replace("01/Jun/2025:12:30:45 +0200", "yesterday");
        assert!(matches!(
            format.parse(&line),
            Err(CidrwatchError::LogLine(_))
        ));
    }

    #[test]
    fn dash_status_and_bytes_count_as_zero() {
        let format = LogFormat::default();
        let line = LINE.replace("200 5316", "- -");
        let request = format.parse(&line).unwrap();
        assert_eq!(request.status, 0);
        assert_eq!(request.bytes, 0);
    }

    #[test]
    fn unknown_method_maps_to_unknown() {
        let format = LogFormat::default();
        let line = LINE.replace("GET /index.html", "PROPFIND /dav");
        let request = format.parse(&line).unwrap();
        assert_eq!(request.method, Method::Unknown);
        assert_eq!(request.uri, "/dav");
    }

    #[test]
    fn template_requires_remote_addr_and_time() {
        assert!(LogFormat::from_template("$status $bytes").is_err());
        assert!(LogFormat::from_template("$remote_addr $status").is_err());
        assert!(LogFormat::from_template("").is_err());
    }

    #[test]
    fn template_rejects_unknown_placeholder() {
        let err =
            LogFormat::from_template("$remote_addr [$time_local] $nonsense").unwrap_err();
        assert!(matches!(err, CidrwatchError::LogFormat(_)));
    }

    #[test]
    fn template_rejects_interior_proxy_addr() {
        let err = LogFormat::from_template(
            "$remote_addr \"$proxy_addr\" [$time_local] \"$request\"",
        )
        .unwrap_err();
        assert!(matches!(err, CidrwatchError::LogFormat(_)));
    }

    #[test]
    fn minimal_template() {
        let format = LogFormat::from_template("$remote_addr [$time_local]").unwrap();
        let request = format
            .parse("10.0.0.1 [01/Jun/2025:00:00:00 +0000]")
            .unwrap();
        assert_eq!(render_addr(request.addr), "10.0.0.1");
        assert_eq!(request.method, Method::Unknown);
        assert_eq!(request.status, 0);
    }
}
