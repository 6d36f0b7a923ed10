//! MIME type helpers.
//!
//! A *full* MIME type carries the container and the complete codec string,
//! e.g. `video/mp4; codecs="avc1.4d401f"`. The *basic* MIME type keeps only
//! the container and the top-level codec family (`avc1`), which is what
//! decides whether two representations can share a media pipeline.

/// Parsed full MIME type: container plus codec list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MimeType {
    pub container: String,
    pub codecs: Vec<String>,
}

/// Container + top-level codec family, used for compatibility grouping.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BasicMime {
    pub container: String,
    pub family: Option<String>,
}

impl MimeType {
    /// Parse a full MIME type string. Returns `None` when the container part
    /// is missing or malformed; an absent `codecs` parameter is allowed.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split(';');
        let container = parts.next()?.trim();
        if container.is_empty() || !container.contains('/') {
            return None;
        }

        let mut codecs = Vec::new();
        for param in parts {
            let param = param.trim();
            if let Some(value) = param.strip_prefix("codecs=") {
                let value = value.trim_matches('"');
                codecs.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|c| !c.is_empty())
                        .map(str::to_owned),
                );
            }
        }

        Some(Self {
            container: container.to_ascii_lowercase(),
            codecs,
        })
    }

    /// Reduce to container + first-codec family.
    #[must_use]
    pub fn basic(&self) -> BasicMime {
        let family = self
            .codecs
            .first()
            .map(|c| c.split('.').next().unwrap_or(c).to_ascii_lowercase());
        BasicMime {
            container: self.container.clone(),
            family,
        }
    }

    /// Whether two full MIME types can share one pipeline: same container
    /// and same top-level codec family.
    #[must_use]
    pub fn compatible_with(&self, other: &MimeType) -> bool {
        self.basic() == other.basic()
    }
}

/// Convenience: parse a raw full MIME type straight to its basic form.
#[must_use]
pub fn basic_mime(raw: &str) -> Option<BasicMime> {
    MimeType::parse(raw).map(|m| m.basic())
}
