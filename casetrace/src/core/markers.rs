//! Static block/skip markers and their resolution at item setup.
//!
//! Precedence is intentionally asymmetric:
//! - block-style markers (`block`, `blockif`): the class-level marker wins
//!   over the method-level one.
//! - skip-style markers (`skip`, `skipif`): the closest (method-level) marker wins.

use crate::core::types::SkipStatus;

pub const BLOCKIF_REASON_REQUIRED: &str = "You need to specify a reason when blocking conditionally.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    Block { reason: String },
    BlockIf { conditions: Vec<bool>, reason: String },
    Skip { reason: String },
    SkipIf { conditions: Vec<bool>, reason: String },
}

impl Marker {
    fn is_block_style(&self) -> bool {
        matches!(self, Marker::Block { .. } | Marker::BlockIf { .. })
    }
}

/// Markers attached to an item, split by the level they were declared at.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Markers {
    pub class: Vec<Marker>,
    pub method: Vec<Marker>,
}

impl Markers {
    pub fn method(marker: Marker) -> Self {
        Self {
            class: Vec::new(),
            method: vec![marker],
        }
    }

    pub fn class(marker: Marker) -> Self {
        Self {
            class: vec![marker],
            method: Vec::new(),
        }
    }

    /// Whether an unconditional `skip` marker is present at any level.
    pub fn has_skip(&self) -> bool {
        self.class
            .iter()
            .chain(self.method.iter())
            .any(|marker| matches!(marker, Marker::Skip { .. }))
    }

    fn block_style(&self) -> Option<&Marker> {
        self.class
            .iter()
            .chain(self.method.iter())
            .find(|marker| marker.is_block_style())
    }

    fn skip_style(&self) -> Option<&Marker> {
        self.method
            .iter()
            .chain(self.class.iter())
            .find(|marker| !marker.is_block_style())
    }
}

/// Decide whether an item is blocked or skipped before its body runs.
///
/// `dynamic_block` carries the registry comment when the item was blocked
/// at runtime (e.g. by a session-wide stop triggered by an earlier item).
pub fn resolve_setup(
    markers: &Markers,
    dynamic_block: Option<&str>,
) -> Result<Option<SkipStatus>, String> {
    if let Some(marker) = markers.block_style() {
        match marker {
            Marker::BlockIf { conditions, reason } => {
                if reason.is_empty() {
                    return Err(BLOCKIF_REASON_REQUIRED.to_string());
                }
                if conditions.iter().any(|condition| *condition) {
                    return Ok(Some(SkipStatus::block(reason.clone())));
                }
            }
            Marker::Block { reason } => {
                let reason = if reason.is_empty() {
                    dynamic_block.unwrap_or_default().to_string()
                } else {
                    reason.clone()
                };
                return Ok(Some(SkipStatus::block(reason)));
            }
            Marker::Skip { .. } | Marker::SkipIf { .. } => {}
        }
    }

    if let Some(comment) = dynamic_block {
        return Ok(Some(SkipStatus::block(comment)));
    }

    match markers.skip_style() {
        Some(Marker::Skip { reason }) => Ok(Some(SkipStatus::skip(reason.clone()))),
        Some(Marker::SkipIf { conditions, reason }) if conditions.iter().any(|c| *c) => {
            Ok(Some(SkipStatus::skip(reason.clone())))
        }
        _ => Ok(None),
    }
}
