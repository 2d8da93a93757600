//! Retryability predicates
//!
//! A predicate inspects an error (and its `source()` chain) and answers whether
//! another attempt is worth making. Predicates work on `&dyn Error` so the same
//! classifier applies to any caller error type; they look at `io::Error` kinds
//! where one is present in the chain and fall back to the rendered message.
//!
//! The building blocks compose with [`any_of`] / [`all_of`] / [`not`], which is how
//! the named presets in [`crate::retry::RetryPolicy`] are assembled.

use std::error::Error as StdError;
use std::io;
use std::sync::Arc;

/// Shared retryability predicate: `true` means "try again"
pub type RetryPredicate = Arc<dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync>;

/// HTTP-style status codes that denote a transient server-side condition
pub const TRANSIENT_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Client-error codes that never succeed on a plain re-send
pub const CLIENT_ERROR_CODES: [u16; 4] = [400, 401, 403, 404];

const NETWORK_PHRASES: [&str; 12] = [
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "connection aborted",
    "connection closed",
    "broken pipe",
    "network is unreachable",
    "temporary failure in name resolution",
    "dns",
    "no such host",
    "could not resolve host",
];

const RATE_LIMIT_PHRASES: [&str; 8] = [
    "rate limit",
    "rate-limit",
    "ratelimit",
    "too many requests",
    "abuse detection",
    "secondary rate",
    "service unavailable",
    "try again later",
];

/// Walk an error and everything it wraps
pub fn error_chain<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |e| (*e).source())
}

/// Lowercased concatenation of every message in the chain
fn chain_text(err: &(dyn StdError + 'static)) -> String {
    error_chain(err)
        .map(|e| e.to_string().to_lowercase())
        .collect::<Vec<_>>()
        .join(": ")
}

fn io_kinds<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = io::ErrorKind> + 'a {
    error_chain(err).filter_map(|e| e.downcast_ref::<io::Error>().map(io::Error::kind))
}

/// Extract every standalone three-digit number in `text` that looks like a status code
pub fn status_codes(text: &str) -> Vec<u16> {
    text.split(|c: char| !c.is_ascii_digit())
        .filter(|token| token.len() == 3)
        .filter_map(|token| token.parse::<u16>().ok())
        .filter(|code| (100..600).contains(code))
        .collect()
}

fn is_transient_io_kind(kind: io::ErrorKind) -> bool {
    use io::ErrorKind::*;
    matches!(
        kind,
        ConnectionRefused
            | ConnectionReset
            | ConnectionAborted
            | NotConnected
            | BrokenPipe
            | TimedOut
            | Interrupted
            | WouldBlock
            | UnexpectedEof
    )
}

fn is_permanent_io_kind(kind: io::ErrorKind) -> bool {
    use io::ErrorKind::*;
    matches!(
        kind,
        NotFound | PermissionDenied | InvalidInput | InvalidData | AlreadyExists | Unsupported
    )
}

/// Network-level transient conditions: timeouts, resets, refusals, DNS failures
pub fn is_network_transient(err: &(dyn StdError + 'static)) -> bool {
    if io_kinds(err).any(is_transient_io_kind) {
        return true;
    }
    let text = chain_text(err);
    NETWORK_PHRASES.iter().any(|phrase| text.contains(phrase))
}

/// HTTP-style transient status codes (408, 429, 500, 502, 503, 504)
pub fn is_http_transient(err: &(dyn StdError + 'static)) -> bool {
    status_codes(&chain_text(err))
        .iter()
        .any(|code| TRANSIENT_STATUS_CODES.contains(code))
}

/// Remote-API signals: rate limiting, abuse detection, service unavailable
///
/// Explicit client errors (400/401/403/404) are not retried unless the message
/// carries a rate-limit phrase, and a 422 is only retried when it is a disguised
/// rate limit.
pub fn is_remote_api_transient(err: &(dyn StdError + 'static)) -> bool {
    let text = chain_text(err);
    if RATE_LIMIT_PHRASES.iter().any(|phrase| text.contains(phrase)) {
        return true;
    }

    let codes = status_codes(&text);
    if codes
        .iter()
        .any(|code| CLIENT_ERROR_CODES.contains(code) || *code == 422)
    {
        return false;
    }

    is_http_transient(err) || is_network_transient(err)
}

/// Local file/staging operations: everything except errors that cannot heal
pub fn is_file_operation_transient(err: &(dyn StdError + 'static)) -> bool {
    !io_kinds(err).any(is_permanent_io_kind)
}

/// Predicate that retries every error
pub fn always() -> RetryPredicate {
    from_fn(|_| true)
}

/// Predicate that never retries
pub fn never() -> RetryPredicate {
    from_fn(|_| false)
}

/// Wrap a plain function as a shared predicate
pub fn from_fn<F>(f: F) -> RetryPredicate
where
    F: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Retry when any of the predicates says so
pub fn any_of(predicates: Vec<RetryPredicate>) -> RetryPredicate {
    from_fn(move |err| predicates.iter().any(|p| p(err)))
}

/// Retry only when every predicate agrees
pub fn all_of(predicates: Vec<RetryPredicate>) -> RetryPredicate {
    from_fn(move |err| predicates.iter().all(|p| p(err)))
}

/// Invert a predicate
pub fn not(predicate: RetryPredicate) -> RetryPredicate {
    from_fn(move |err| !predicate(err))
}
