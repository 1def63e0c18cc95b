//! HTTP request-head parsing and rewriting.
//!
//! Only the request head is ever parsed; response bytes are relayed
//! verbatim. Parsing is textual and tolerant: the head is decoded with
//! U+FFFD replacement and searched case-insensitively, which is how an
//! intercepting proxy survives half-broken clients.

/// Default origin port for plain requests.
pub const DEFAULT_HTTP_PORT: u16 = 80;
/// Default origin port for CONNECT tunnels.
pub const DEFAULT_TLS_PORT: u16 = 443;

/// A request head decoded from the bytes read up to the header terminator.
#[derive(Debug, Clone)]
pub struct RequestHead {
    text: String,
}

impl RequestHead {
    pub fn parse(bytes: &[u8]) -> RequestHead {
        RequestHead {
            text: String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    /// The request line, without the trailing line break.
    pub fn start_line(&self) -> &str {
        let line = match self.text.find('\n') {
            Some(idx) => &self.text[..idx],
            None => &self.text,
        };
        line.trim_end_matches('\r')
    }

    /// True for CONNECT tunnels.
    pub fn is_connect(&self) -> bool {
        starts_with_ignore_case(self.start_line(), "connect ")
    }

    /// The `Host:` line value, located by a case-insensitive search.
    fn host_value(&self) -> Option<&str> {
        let lower = self.text.to_ascii_lowercase();
        let start = lower.find("host")?;
        let rest = &self.text[start..];
        let line = match rest.find('\n') {
            Some(idx) => &rest[..idx],
            None => rest,
        };
        // Skip the five bytes of "host:".
        Some(line.get(5..).unwrap_or("").trim())
    }

    /// The origin host: the `Host:` value stripped of scheme, userinfo,
    /// path, and port. `None` when the request carries no host line.
    pub fn target_host(&self) -> Option<String> {
        let mut host = self.host_value()?;
        host = host
            .strip_prefix("http://")
            .or_else(|| host.strip_prefix("https://"))
            .unwrap_or(host)
            .trim();
        let host = host.split('/').next().unwrap_or("");
        let host = host.rsplit('@').next().unwrap_or("");
        let host = host.trim_matches('/');
        let host = host.split(':').next().unwrap_or("");
        Some(host.to_owned())
    }

    /// The origin port: an explicit `:port` on the host line wins, else 443
    /// for CONNECT, else 80.
    pub fn target_port(&self) -> u16 {
        if let Some(value) = self.host_value() {
            if let Some(after_colon) = value.splitn(2, ':').nth(1) {
                let digits = after_colon.split('/').next().unwrap_or("");
                if let Ok(port) = digits.parse::<u16>() {
                    return port;
                }
            }
        }
        if self.is_connect() {
            DEFAULT_TLS_PORT
        } else {
            DEFAULT_HTTP_PORT
        }
    }

    /// The eight bytes starting at the first `HTTP/`, used verbatim in the
    /// 502 response so the client sees its own version back.
    pub fn version(&self) -> &str {
        let lower = self.text.to_ascii_lowercase();
        lower
            .find("http/")
            .and_then(|idx| self.text.get(idx..idx + 8))
            .unwrap_or("HTTP/1.0")
    }

    /// Downgrade the request for the single-shot forward: the first `/1.1`
    /// becomes `/1.0` and every `keep-alive` becomes `close`.
    pub fn rewritten(&self) -> String {
        self.text.replacen("/1.1", "/1.0", 1).replace("keep-alive", "close")
    }
}

fn starts_with_ignore_case(text: &str, prefix: &str) -> bool {
    text.get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}
