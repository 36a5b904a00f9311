//! Per-request attempt tracking.

use http::Method;
use url::Url;

/// One execution of a logical request.
///
/// The counter starts at 1 and [`next`](Self::next) increments it by exactly
/// one. A new `RequestAttempt` is created for every logical call and dropped
/// when the call returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestAttempt {
    method: Method,
    url: Url,
    number: usize,
}

impl RequestAttempt {
    /// Creates the first attempt for `method` and `url`.
    pub fn first(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            number: 1,
        }
    }

    /// Advances to the following attempt.
    pub fn next(&mut self) {
        self.number += 1;
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The 1-based attempt number.
    pub fn number(&self) -> usize {
        self.number
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_is_one_based_and_monotonic() {
        let url = Url::parse("http://localhost/items").unwrap();
        let mut attempt = RequestAttempt::first(Method::GET, url.clone());
        assert_eq!(attempt.number(), 1);

        attempt.next();
        attempt.next();
        assert_eq!(attempt.number(), 3);
        assert_eq!(attempt.method(), &Method::GET);
        assert_eq!(attempt.url(), &url);
    }
}
