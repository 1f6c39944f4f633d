//! Topic patterns, matching and the namespace topic convention
//!
//! Patterns follow MQTT filter syntax: `/`-delimited segments where `+` matches
//! exactly one segment and a trailing `#` matches one or more remaining segments.
//! Device topics follow `{namespace}/sensors/{id}/data`, `{namespace}/alerts` and
//! `{namespace}/commands/{id}`.

use std::fmt;
use thiserror::Error;

const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

/// Topic validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,
    #[error("Topic contains a NUL character: '{0}'")]
    NulCharacter(String),
    #[error("Wildcard must occupy a whole segment in '{pattern}' (segment '{segment}')")]
    PartialWildcard { pattern: String, segment: String },
    #[error("Multi-level wildcard '#' must be the last segment in '{0}'")]
    MisplacedMultiLevel(String),
    #[error("Publish topic must not contain wildcards: '{0}'")]
    WildcardInTopic(String),
    #[error("Invalid device identifier: '{0}'")]
    InvalidDeviceId(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    SingleLevel,
    MultiLevel,
}

/// A validated subscription pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Parse and validate a pattern such as `waste-wise/sensors/+/data`
    pub fn parse(pattern: &str) -> Result<Self, TopicError> {
        if pattern.is_empty() {
            return Err(TopicError::Empty);
        }
        if pattern.contains('\0') {
            return Err(TopicError::NulCharacter(pattern.to_string()));
        }

        let parts: Vec<&str> = pattern.split('/').collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());

        for (index, part) in parts.iter().enumerate() {
            let segment = match *part {
                SINGLE_LEVEL => Segment::SingleLevel,
                MULTI_LEVEL if index == last => Segment::MultiLevel,
                MULTI_LEVEL => return Err(TopicError::MisplacedMultiLevel(pattern.to_string())),
                literal if literal.contains('+') || literal.contains('#') => {
                    return Err(TopicError::PartialWildcard {
                        pattern: pattern.to_string(),
                        segment: literal.to_string(),
                    });
                }
                literal => Segment::Literal(literal.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn has_wildcards(&self) -> bool {
        self.segments
            .iter()
            .any(|s| !matches!(s, Segment::Literal(_)))
    }

    /// Index of the first `+` segment, where a matched topic carries its device id
    pub fn device_segment(&self) -> Option<usize> {
        self.segments
            .iter()
            .position(|s| matches!(s, Segment::SingleLevel))
    }

    /// Check whether a concrete topic matches this pattern
    pub fn matches(&self, topic: &str) -> bool {
        self.captures(topic).is_some()
    }

    /// Match a topic and return the segments bound to each wildcard, in order.
    ///
    /// A `#` capture is the joined remainder of the topic. Topics beginning with
    /// `$` are never matched by a leading wildcard.
    pub fn captures<'a>(&self, topic: &'a str) -> Option<Vec<&'a str>> {
        if topic.is_empty() {
            return None;
        }
        if topic.starts_with('$')
            && matches!(
                self.segments.first(),
                Some(Segment::SingleLevel | Segment::MultiLevel)
            )
        {
            return None;
        }

        let mut captures = Vec::new();
        let mut rest = Some(topic);

        for segment in &self.segments {
            match segment {
                Segment::MultiLevel => {
                    // One or more trailing segments
                    let remainder = rest?;
                    captures.push(remainder);
                    return Some(captures);
                }
                Segment::SingleLevel => {
                    let (head, tail) = split_first_segment(rest?);
                    captures.push(head);
                    rest = tail;
                }
                Segment::Literal(expected) => {
                    let (head, tail) = split_first_segment(rest?);
                    if head != expected {
                        return None;
                    }
                    rest = tail;
                }
            }
        }

        match rest {
            None => Some(captures),
            Some(_) => None,
        }
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn split_first_segment(topic: &str) -> (&str, Option<&str>) {
    match topic.split_once('/') {
        Some((head, tail)) => (head, Some(tail)),
        None => (topic, None),
    }
}

/// Validate a concrete topic used for publishing
pub fn validate_publish_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.contains('\0') {
        return Err(TopicError::NulCharacter(topic.to_string()));
    }
    if topic.contains('+') || topic.contains('#') {
        return Err(TopicError::WildcardInTopic(topic.to_string()));
    }
    Ok(())
}

/// Validate a device identifier taken from or inserted into a topic
pub fn validate_device_id(device_id: &str) -> Result<(), TopicError> {
    let invalid = device_id.is_empty()
        || device_id
            .chars()
            .any(|c| matches!(c, '/' | '+' | '#' | '\0') || c.is_whitespace());
    if invalid {
        return Err(TopicError::InvalidDeviceId(device_id.to_string()));
    }
    Ok(())
}

/// Return the segment at `index` of a `/`-delimited topic, if present and non-empty
pub fn topic_segment(topic: &str, index: usize) -> Option<&str> {
    topic.split('/').nth(index).filter(|s| !s.is_empty())
}

/// Builds topics and default filters for one namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    namespace: String,
}

impl TopicBuilder {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into().trim_matches('/').to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// `{namespace}/sensors/+/data`
    pub fn sensor_data_filter(&self) -> String {
        format!("{}/sensors/+/data", self.namespace)
    }

    /// `{namespace}/sensors/+/status`
    pub fn status_filter(&self) -> String {
        format!("{}/sensors/+/status", self.namespace)
    }

    /// `{namespace}/alerts`
    pub fn alerts_topic(&self) -> String {
        format!("{}/alerts", self.namespace)
    }

    /// `{namespace}/commands/+`
    pub fn commands_filter(&self) -> String {
        format!("{}/commands/+", self.namespace)
    }

    /// `{namespace}/commands/{device_id}`
    pub fn command_topic(&self, device_id: &str) -> Result<String, TopicError> {
        validate_device_id(device_id)?;
        Ok(format!("{}/commands/{device_id}", self.namespace))
    }
}
