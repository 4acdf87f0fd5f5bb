/*!
    Data-type descriptors for pads.

    Written in the GStreamer caps string syntax: structures separated by `;`,
    each a media type followed by `key=value` fields. Type annotations such as
    `(string)` are ignored and list or range values act as wildcards.
*/

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/**
    One `media/type, key=value, ...` entry.
*/
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapsStructure {
    media_type: String,
    fields: BTreeMap<String, String>,
}

impl CapsStructure {
    pub fn new(media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    fn compatible_with(&self, other: &CapsStructure) -> bool {
        if self.media_type != other.media_type {
            return false;
        }
        self.fields.iter().all(|(key, value)| match other.fields.get(key) {
            Some(theirs) => is_wildcard(value) || is_wildcard(theirs) || value == theirs,
            None => true,
        })
    }
}

fn is_wildcard(value: &str) -> bool {
    value.starts_with('{') || value.starts_with('[')
}

/**
    A set of acceptable data types, or `ANY`.
*/
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Caps {
    Any,
    Structures(Vec<CapsStructure>),
}

impl Caps {
    pub fn any() -> Self {
        Self::Any
    }

    pub fn single(structure: CapsStructure) -> Self {
        Self::Structures(vec![structure])
    }

    /// RTP carrying H.264 video, what `rtspsrc` hands to the depayloader.
    pub fn rtp_h264() -> Self {
        Self::single(
            CapsStructure::new("application/x-rtp")
                .field("media", "video")
                .field("encoding-name", "H264"),
        )
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }

    /**
        True when some structure of `self` agrees with some structure of
        `other` on media type and on every field both of them define.
    */
    pub fn can_intersect(&self, other: &Caps) -> bool {
        match (self, other) {
            (Self::Any, _) | (_, Self::Any) => true,
            (Self::Structures(ours), Self::Structures(theirs)) => ours
                .iter()
                .any(|a| theirs.iter().any(|b| a.compatible_with(b))),
        }
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "ANY"),
            Self::Structures(structures) if structures.is_empty() => write!(f, "EMPTY"),
            Self::Structures(structures) => {
                for (i, s) in structures.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}", s.media_type)?;
                    for (key, value) in &s.fields {
                        write!(f, ", {}={}", key, value)?;
                    }
                }
                Ok(())
            }
        }
    }
}

/**
    Error for caps strings that have no media type.
*/
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed caps '{0}'")]
pub struct CapsParseError(pub String);

impl FromStr for Caps {
    type Err = CapsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("ANY") {
            return Ok(Self::Any);
        }
        if trimmed.eq_ignore_ascii_case("EMPTY") {
            return Ok(Self::Structures(Vec::new()));
        }

        let mut structures = Vec::new();
        for part in split_top_level(trimmed, ';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let mut pieces = split_top_level(part, ',').into_iter();
            let media_type = pieces.next().unwrap_or_default().trim().to_string();
            if media_type.is_empty() || media_type.contains('=') {
                return Err(CapsParseError(s.to_string()));
            }
            // drop GStreamer caps features like "video/x-raw(memory:GLMemory)"
            let media_type = match media_type.split_once('(') {
                Some((head, _)) => head.to_string(),
                None => media_type,
            };

            let mut structure = CapsStructure::new(media_type);
            for field in pieces {
                let Some((key, value)) = field.split_once('=') else {
                    return Err(CapsParseError(s.to_string()));
                };
                structure
                    .fields
                    .insert(key.trim().to_string(), strip_type_annotation(value));
            }
            structures.push(structure);
        }

        if structures.is_empty() {
            return Err(CapsParseError(s.to_string()));
        }
        Ok(Self::Structures(structures))
    }
}

fn strip_type_annotation(value: &str) -> String {
    let value = value.trim();
    let value = match value.strip_prefix('(') {
        Some(rest) => rest.split_once(')').map(|(_, v)| v).unwrap_or(rest),
        None => value,
    };
    value.trim().trim_matches('"').to_string()
}

// Splits on `sep` outside of {...} / [...] / "..." groups.
fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '{' | '[' if !quoted => depth += 1,
            '}' | ']' if !quoted => depth -= 1,
            c if c == sep && depth == 0 && !quoted => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gstreamer_caps_string() {
        let caps: Caps = "application/x-rtp, media=(string)video, payload=(int)96, \
                          encoding-name=(string)H264"
            .parse()
            .unwrap();
        let Caps::Structures(structures) = &caps else {
            panic!("expected structures");
        };
        assert_eq!(structures.len(), 1);
        assert_eq!(structures[0].media_type(), "application/x-rtp");
        assert_eq!(structures[0].get("media"), Some("video"));
        assert_eq!(structures[0].get("payload"), Some("96"));
    }

    #[test]
    fn rtp_source_fits_depayloader() {
        let offered: Caps = "application/x-rtp, media=video, clock-rate=90000, encoding-name=H264"
            .parse()
            .unwrap();
        assert!(offered.can_intersect(&Caps::rtp_h264()));
    }

    #[test]
    fn different_encoding_does_not_fit() {
        let offered: Caps = "application/x-rtp, media=video, encoding-name=H265"
            .parse()
            .unwrap();
        assert!(!offered.can_intersect(&Caps::rtp_h264()));

        let container: Caps = "video/quicktime".parse().unwrap();
        assert!(!container.can_intersect(&Caps::rtp_h264()));
    }

    #[test]
    fn lists_and_ranges_are_wildcards() {
        let template: Caps =
            "application/x-rtp, media=video, clock-rate=[ 1, 2147483647 ], encoding-name={ H264, H265 }"
                .parse()
                .unwrap();
        let offered: Caps = "application/x-rtp, media=video, clock-rate=90000, encoding-name=H264"
            .parse()
            .unwrap();
        assert!(offered.can_intersect(&template));
    }

    #[test]
    fn any_and_multiple_structures() {
        assert!(Caps::any().can_intersect(&Caps::rtp_h264()));
        let multi: Caps = "video/mpegts; application/x-rtp, media=video"
            .parse()
            .unwrap();
        assert!(multi.can_intersect(&Caps::rtp_h264()));
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Caps>().is_err());
        assert!("media=video".parse::<Caps>().is_err());
        assert!("video/x-raw, width".parse::<Caps>().is_err());
    }

    #[test]
    fn display_round_trips_fields() {
        let caps = Caps::rtp_h264();
        assert_eq!(
            caps.to_string(),
            "application/x-rtp, encoding-name=H264, media=video"
        );
    }
}
