//! Grid data model: colors, cells and committed mutation events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::SyncError;

/// A normalized 24-bit RGB color, stored as `0x00RRGGBB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Color(u32);

impl Color {
    pub const BLACK: Color = Color(0x000000);
    pub const WHITE: Color = Color(0xFFFFFF);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self(((r as u32) << 16) | ((g as u32) << 8) | b as u32)
    }

    /// Build from a packed value; the top byte is masked off.
    pub const fn from_u32(value: u32) -> Self {
        Self(value & 0x00FF_FFFF)
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    pub const fn r(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub const fn g(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn b(self) -> u8 {
        self.0 as u8
    }

    /// Parse `#rrggbb` or `#rgb`. The `#` is optional, case is ignored.
    pub fn parse_hex(input: &str) -> Result<Self, SyncError> {
        let digits = input.trim().trim_start_matches('#');
        let invalid = || SyncError::InvalidColor(input.to_string());

        if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }

        match digits.len() {
            6 => u32::from_str_radix(digits, 16)
                .map(Color::from_u32)
                .map_err(|_| invalid()),
            3 => {
                // #abc expands to #aabbcc
                let expanded: String = digits.chars().flat_map(|c| [c, c]).collect();
                u32::from_str_radix(&expanded, 16)
                    .map(Color::from_u32)
                    .map_err(|_| invalid())
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:06x}", self.0)
    }
}

impl FromStr for Color {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Color::parse_hex(s)
    }
}

/// The twenty-color palette offered by the classic editor.
pub fn classic_palette() -> Vec<Color> {
    [
        0xe6194b, 0xf58231, 0xffe119, 0xbcf60c, 0x3cb44b, 0xaaffc3, 0x46f0f0, 0x008080,
        0x4363d8, 0x000075, 0x911eb4, 0xf032e6, 0xe6beff, 0xfabebe, 0xfffac8, 0x9a6324,
        0x808000, 0x808080, 0x000000, 0xffffff,
    ]
    .into_iter()
    .map(Color::from_u32)
    .collect()
}

/// A live pixel on the grid.
///
/// `id` is assigned when the coordinate becomes occupied and survives
/// color changes. Deleting and repainting the coordinate yields a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub id: Uuid,
    pub x: u32,
    pub y: u32,
    pub color: Color,
}

impl Cell {
    pub fn new(x: u32, y: u32, color: Color) -> Self {
        Self {
            id: Uuid::new_v4(),
            x,
            y,
            color,
        }
    }

    pub fn coord(&self) -> (u32, u32) {
        (self.x, self.y)
    }
}

/// What a single commit did to the grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// A previously empty coordinate now holds `Cell`.
    Insert(Cell),
    /// An occupied coordinate changed color; the id is unchanged.
    Update(Cell),
    /// The cell was removed.
    Delete { cell_id: Uuid, x: u32, y: u32 },
    /// Every cell was removed in one step.
    ClearAll,
}

/// A committed mutation stamped with its position in the global commit order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationEvent {
    pub sequence: u64,
    pub mutation: Mutation,
}

impl MutationEvent {
    pub fn new(sequence: u64, mutation: Mutation) -> Self {
        Self { sequence, mutation }
    }

    /// Coordinate touched by this event, `None` for `ClearAll`.
    pub fn coord(&self) -> Option<(u32, u32)> {
        match &self.mutation {
            Mutation::Insert(cell) | Mutation::Update(cell) => Some(cell.coord()),
            Mutation::Delete { x, y, .. } => Some((*x, *y)),
            Mutation::ClearAll => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_long_hex() {
        let c = Color::parse_hex("#FF0000").unwrap();
        assert_eq!(c, Color::rgb(255, 0, 0));
        assert_eq!(c.to_string(), "#ff0000");
    }

    #[test]
    fn test_parse_short_hex() {
        let c: Color = "0f8".parse().unwrap();
        assert_eq!(c, Color::from_u32(0x00ff88));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Color::parse_hex("#12345").is_err());
        assert!(Color::parse_hex("#gg0000").is_err());
        assert!(Color::parse_hex("deleteSingle").is_err());
        assert!(Color::parse_hex("").is_err());
        assert!(Color::parse_hex("#+12345").is_err());
    }

    #[test]
    fn test_from_u32_masks_alpha() {
        let c = Color::from_u32(0xAB12_3456);
        assert_eq!(c.to_u32(), 0x12_3456);
        assert_eq!((c.r(), c.g(), c.b()), (0x12, 0x34, 0x56));
    }

    #[test]
    fn test_classic_palette() {
        let palette = classic_palette();
        assert_eq!(palette.len(), 20);
        assert!(palette.contains(&Color::BLACK));
        assert!(palette.contains(&Color::WHITE));
    }

    #[test]
    fn test_new_cells_get_distinct_ids() {
        let a = Cell::new(0, 0, Color::BLACK);
        let b = Cell::new(0, 0, Color::BLACK);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_event_coord() {
        let cell = Cell::new(2, 3, Color::WHITE);
        assert_eq!(MutationEvent::new(1, Mutation::Insert(cell)).coord(), Some((2, 3)));
        assert_eq!(MutationEvent::new(2, Mutation::ClearAll).coord(), None);
    }
}
