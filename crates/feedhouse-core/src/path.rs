//! Feed Paths
//!
//! Every feed and every message in FeedHouse is addressed by a `FeedPath`: an immutable
//! sequence of typed segments.
//!
//! ## Segment Types
//!
//! - **FeedId**: cluster-assigned root discriminator (`~id`)
//! - **Feed**: a named node in the feed tree, optionally versioned (`orders@v2`)
//! - **MessageId**: identifies a single message; only valid as the last segment (`~~id`)
//!
//! Segments order by type first (FeedId < Feed < MessageId), then by value, so paths
//! compare lexicographically segment by segment.
//!
//! ## String Form
//!
//! ```text
//! /                          root feed
//! /shop/orders               two feed segments
//! /shop/orders@v2            versioned feed segment
//! /~tenant-1/orders          feed id segment followed by a feed
//! /shop/orders/~~4f1c...     a message inside /shop/orders
//! /a\/b                      one feed named "a/b"
//! ```
//!
//! `\` escapes any of `/ \ @ ~` inside a value. Printing always escapes those
//! characters, so `parse(path.to_string()) == path` for every valid path.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const SEPARATOR: char = '/';
const ESCAPE: char = '\\';
const VERSION: char = '@';
const ID_MARKER: char = '~';

/// One typed element of a `FeedPath`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Segment {
    FeedId(String),
    Feed { name: String, version: Option<String> },
    MessageId(String),
}

impl Segment {
    pub fn feed_id(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidIdentifier("feed id must not be empty".to_string()));
        }
        Ok(Segment::FeedId(id))
    }

    pub fn feed(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidIdentifier("feed name must not be empty".to_string()));
        }
        Ok(Segment::Feed {
            name,
            version: None,
        })
    }

    pub fn versioned(name: impl Into<String>, version: impl Into<String>) -> Result<Self> {
        let version = version.into();
        if version.is_empty() {
            return Err(Error::InvalidIdentifier(
                "feed version must not be empty".to_string(),
            ));
        }
        match Segment::feed(name)? {
            Segment::Feed { name, .. } => Ok(Segment::Feed {
                name,
                version: Some(version),
            }),
            other => Ok(other),
        }
    }

    pub fn message_id(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidIdentifier("message id must not be empty".to_string()));
        }
        Ok(Segment::MessageId(id))
    }

    pub fn is_message_id(&self) -> bool {
        matches!(self, Segment::MessageId(_))
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::FeedId(id) => write!(f, "{}{}", ID_MARKER, escape(id)),
            Segment::MessageId(id) => write!(f, "{}{}{}", ID_MARKER, ID_MARKER, escape(id)),
            Segment::Feed { name, version } => {
                write!(f, "{}", escape(name))?;
                if let Some(version) = version {
                    write!(f, "{}{}", VERSION, escape(version))?;
                }
                Ok(())
            }
        }
    }
}

/// Address of a feed, or of a message when the last segment is a `MessageId`
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeedPath {
    segments: Vec<Segment>,
}

impl FeedPath {
    /// The root feed `/`
    pub fn root() -> Self {
        Self::default()
    }

    /// Build a path from segments, checking that only the last one is a message id
    pub fn from_segments(segments: Vec<Segment>) -> Result<Self> {
        let last = segments.len().saturating_sub(1);
        if let Some(pos) = segments.iter().position(Segment::is_message_id) {
            if pos != last {
                return Err(Error::InvalidPath(
                    "a message id may only be the last segment".to_string(),
                ));
            }
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Append a segment
    pub fn child(&self, segment: Segment) -> Result<Self> {
        if self.message_id().is_some() {
            return Err(Error::InvalidPath(format!(
                "cannot descend below message path {}",
                self
            )));
        }
        let mut segments = self.segments.clone();
        segments.push(segment);
        Ok(Self { segments })
    }

    /// Append an unversioned feed segment
    pub fn feed(&self, name: impl Into<String>) -> Result<Self> {
        self.child(Segment::feed(name)?)
    }

    /// The path of a message with id `id` inside this feed
    pub fn with_message_id(&self, id: impl Into<String>) -> Result<Self> {
        self.feed_path().child(Segment::message_id(id)?)
    }

    /// Parent path, `None` for the root
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn message_id(&self) -> Option<&str> {
        match self.segments.last() {
            Some(Segment::MessageId(id)) => Some(id),
            _ => None,
        }
    }

    /// This path without its message id segment
    pub fn feed_path(&self) -> Self {
        match self.message_id() {
            Some(_) => Self {
                segments: self.segments[..self.segments.len() - 1].to_vec(),
            },
            None => self.clone(),
        }
    }

    /// True if `other` lies in the subtree rooted at this path (including itself)
    pub fn contains(&self, other: &FeedPath) -> bool {
        other.segments.starts_with(&self.segments)
    }

    /// This path followed by each ancestor up to and including the root
    pub fn ancestors(&self) -> impl Iterator<Item = FeedPath> + '_ {
        (0..=self.segments.len()).rev().map(move |len| Self {
            segments: self.segments[..len].to_vec(),
        })
    }
}

impl fmt::Display for FeedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "{}", SEPARATOR);
        }
        for segment in &self.segments {
            write!(f, "{}{}", SEPARATOR, segment)?;
        }
        Ok(())
    }
}

impl FromStr for FeedPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix(SEPARATOR)
            .ok_or_else(|| Error::InvalidPath(format!("path must start with '/': {s:?}")))?;

        if rest.is_empty() {
            return Ok(FeedPath::root());
        }

        let segments = tokenize(rest, s)?
            .into_iter()
            .map(|token| parse_segment(token, s))
            .collect::<Result<Vec<_>>>()?;

        FeedPath::from_segments(segments)
    }
}

impl TryFrom<String> for FeedPath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<FeedPath> for String {
    fn from(path: FeedPath) -> Self {
        path.to_string()
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, SEPARATOR | ESCAPE | VERSION | ID_MARKER) {
            out.push(ESCAPE);
        }
        out.push(c);
    }
    out
}

/// A character of a token and whether it was escaped
type Token = Vec<(char, bool)>;

fn tokenize(rest: &str, original: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut current = Token::new();
    let mut chars = rest.chars();

    while let Some(c) = chars.next() {
        match c {
            ESCAPE => match chars.next() {
                Some(escaped) => current.push((escaped, true)),
                None => {
                    return Err(Error::InvalidPath(format!(
                        "dangling escape character in {original:?}"
                    )))
                }
            },
            SEPARATOR => tokens.push(std::mem::take(&mut current)),
            other => current.push((other, false)),
        }
    }
    tokens.push(current);

    if tokens.iter().any(|t| t.is_empty()) {
        return Err(Error::InvalidPath(format!("empty segment in {original:?}")));
    }
    Ok(tokens)
}

fn parse_segment(token: Token, original: &str) -> Result<Segment> {
    let is_marker = |i: usize| matches!(token.get(i), Some(&(ID_MARKER, false)));

    if is_marker(0) && is_marker(1) {
        return Segment::message_id(plain_value(&token[2..], original)?);
    }
    if is_marker(0) {
        return Segment::feed_id(plain_value(&token[1..], original)?);
    }

    match token.iter().position(|&(c, escaped)| c == VERSION && !escaped) {
        Some(at) => Segment::versioned(
            plain_value(&token[..at], original)?,
            plain_value(&token[at + 1..], original)?,
        ),
        None => Segment::feed(plain_value(&token, original)?),
    }
}

/// Collapse a token slice into its value, rejecting unescaped reserved characters
fn plain_value(chars: &[(char, bool)], original: &str) -> Result<String> {
    chars
        .iter()
        .map(|&(c, escaped)| {
            if !escaped && matches!(c, VERSION | ID_MARKER) {
                Err(Error::InvalidPath(format!(
                    "unexpected '{c}' in {original:?}"
                )))
            } else {
                Ok(c)
            }
        })
        .collect()
}
