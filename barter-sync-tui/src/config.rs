use barter_sync::ResponseShape;

pub const DEFAULT_SYMBOLS: &str = "BTCUSDT,ETHUSDT,SOLUSDT";
pub const DEFAULT_UPSTREAM_URL: &str = "https://fapi.binance.com";
pub const DEFAULT_LOG_FILE: &str = "oi-dashboard.log";

/// Parse a comma separated symbol list, eg/ "btcusdt, ethusdt".
pub fn parse_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Get symbols from SYMBOLS env var (default: BTCUSDT,ETHUSDT,SOLUSDT)
pub fn get_symbols() -> Vec<String> {
    let symbols = std::env::var("SYMBOLS")
        .map(|raw| parse_symbols(&raw))
        .unwrap_or_default();

    if symbols.is_empty() {
        parse_symbols(DEFAULT_SYMBOLS)
    } else {
        symbols
    }
}

/// Get upstream base URL from UPSTREAM_URL env var (default: Binance USD-M futures REST)
pub fn get_upstream_url() -> String {
    std::env::var("UPSTREAM_URL").unwrap_or_else(|_| DEFAULT_UPSTREAM_URL.to_string())
}

/// Response shape of an upstream: the exchange itself speaks raw payloads, a caching layer in
/// front of it speaks envelopes.
pub fn upstream_shape(url: &str) -> ResponseShape {
    if url.trim_end_matches('/') == DEFAULT_UPSTREAM_URL {
        ResponseShape::Raw
    } else {
        ResponseShape::Envelope
    }
}

/// Get log file path from LOG_FILE env var (default: oi-dashboard.log)
pub fn get_log_file() -> String {
    std::env::var("LOG_FILE").unwrap_or_else(|_| DEFAULT_LOG_FILE.to_string())
}

/// Symbol following `current` in `symbols`, wrapping around.
pub fn next_symbol<'a>(symbols: &'a [String], current: &str) -> Option<&'a str> {
    if symbols.is_empty() {
        return None;
    }
    let index = symbols
        .iter()
        .position(|symbol| symbol == current)
        .map_or(0, |index| (index + 1) % symbols.len());
    Some(symbols[index].as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_symbols() {
        struct TestCase {
            input: &'static str,
            expected: Vec<&'static str>,
        }

        let cases = vec![
            // TC0: default list
            TestCase {
                input: DEFAULT_SYMBOLS,
                expected: vec!["BTCUSDT", "ETHUSDT", "SOLUSDT"],
            },
            // TC1: whitespace & case normalised
            TestCase {
                input: " btcusdt ,xrpusdt",
                expected: vec!["BTCUSDT", "XRPUSDT"],
            },
            // TC2: empty entries dropped
            TestCase {
                input: ",,",
                expected: vec![],
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            assert_eq!(parse_symbols(test.input), test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_next_symbol_wraps() {
        let symbols = parse_symbols(DEFAULT_SYMBOLS);

        assert_eq!(next_symbol(&symbols, "BTCUSDT"), Some("ETHUSDT"));
        assert_eq!(next_symbol(&symbols, "SOLUSDT"), Some("BTCUSDT"));
        assert_eq!(next_symbol(&symbols, "DOGEUSDT"), Some("BTCUSDT"));
        assert_eq!(next_symbol(&[], "BTCUSDT"), None);
    }

    #[test]
    fn test_upstream_shape() {
        assert_eq!(upstream_shape("https://fapi.binance.com/"), ResponseShape::Raw);
        assert_eq!(upstream_shape("http://127.0.0.1:8080"), ResponseShape::Envelope);
    }
}
