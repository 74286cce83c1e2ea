//! Type-specific clean-up applied to main-window messages before they are
//! persisted.
//!
//! Instances prefix some message kinds with a bracketed tag (`[语音]`,
//! `[名片]`, `[链接]`) and report media as a local path. Tags are stripped and
//! media paths are recorded for a later download step.

use serde::Serialize;

/// Media kinds whose content is a local file path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    File,
    Video,
}

impl AttachmentKind {
    fn from_message_type(kind: &str) -> Option<Self> {
        match kind.to_ascii_lowercase().as_str() {
            "image" | "img" | "picture" => Some(Self::Image),
            "file" => Some(Self::File),
            "video" => Some(Self::Video),
            _ => None,
        }
    }

    fn placeholder(self) -> &'static str {
        match self {
            Self::Image => "[图片]",
            Self::File => "[文件]",
            Self::Video => "[视频]",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub path: String,
}

/// Cleaned content plus any media reference it carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    pub content: String,
    pub attachment: Option<Attachment>,
}

const STRIPPED_TAGS: &[&str] = &[
    "[名片]", "[语音]", "[链接]", "[card]", "[voice]", "[link]",
];

fn looks_like_path(value: &str) -> bool {
    let value = value.trim();
    let has_separator = value.contains('/') || value.contains('\\');
    let has_extension = value
        .rsplit_once('.')
        .is_some_and(|(stem, ext)| !stem.is_empty() && !ext.is_empty() && ext.len() <= 5);
    has_separator && has_extension && !value.contains('\n')
}

/// Normalise content for the given message type.
pub fn prepare(message_type: &str, content: &str) -> Prepared {
    if let Some(kind) = AttachmentKind::from_message_type(message_type)
        && looks_like_path(content)
    {
        let path = content.trim().to_string();
        let content = match kind {
            AttachmentKind::File => {
                let name = path.rsplit(['/', '\\']).next().unwrap_or_default();
                format!("{} {name}", kind.placeholder())
            },
            _ => kind.placeholder().to_string(),
        };
        return Prepared {
            content,
            attachment: Some(Attachment { kind, path }),
        };
    }

    let trimmed = content.trim_start();
    for tag in STRIPPED_TAGS {
        if let Some(rest) = trimmed.strip_prefix(tag) {
            let rest = rest.trim();
            return Prepared {
                content: if rest.is_empty() {
                    (*tag).to_string()
                } else {
                    rest.to_string()
                },
                attachment: None,
            };
        }
    }

    Prepared {
        content: content.to_string(),
        attachment: None,
    }
}
