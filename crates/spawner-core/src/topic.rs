//! Hierarchical event topics.
//!
//! A [`Topic`] is an immutable, ordered sequence of string tokens, written
//! in dotted form (`state.web.exit`). Subscribing to a topic also receives
//! every publication on topics it is a prefix of; the empty topic is the
//! wildcard and receives everything.

use std::fmt;
use std::sync::Arc;

/// An immutable multipart event topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(Arc<[String]>);

impl Topic {
    /// The empty topic, used for wildcard subscriptions.
    pub fn wildcard() -> Self {
        Topic(Arc::from(Vec::new()))
    }

    /// Build a topic from an ordered sequence of tokens.
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Topic(Arc::from(
            tokens.into_iter().map(Into::into).collect::<Vec<_>>(),
        ))
    }

    /// Parse a dotted topic string.
    ///
    /// Empty segments are dropped, so a trailing dot is tolerated and
    /// `"."` (or `""`) parses to the wildcard.
    pub fn parse(s: &str) -> Self {
        Topic::new(s.split('.').filter(|token| !token.is_empty()))
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether this is the wildcard (empty) topic.
    pub fn is_wildcard(&self) -> bool {
        self.0.is_empty()
    }

    /// The final token, if any.
    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// A new topic with `token` appended.
    pub fn child(&self, token: impl Into<String>) -> Self {
        let mut tokens: Vec<String> = self.0.to_vec();
        tokens.push(token.into());
        Topic(Arc::from(tokens))
    }

    /// All non-empty prefixes `(t1..ti)` for `1 <= i <= len`, shortest
    /// first. The full topic is its own final prefix.
    pub fn prefixes(&self) -> impl Iterator<Item = Topic> + '_ {
        (1..=self.0.len()).map(move |i| Topic(Arc::from(self.0[..i].to_vec())))
    }

    /// Whether `prefix` matches the leading tokens of this topic.
    pub fn starts_with(&self, prefix: &Topic) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Topic::parse(s)
    }
}

impl<const N: usize> From<[&str; N]> for Topic {
    fn from(tokens: [&str; N]) -> Self {
        Topic::new(tokens)
    }
}
