//! Named offsets into the service's positional JSON arrays.
//!
//! Each slot is a path of array indices relative to the value it is read
//! from. Keeping them in one table means a layout change on the server is a
//! one-line edit here.

use crate::error::{GeminiError, Result};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    pub name: &'static str,
    pub path: &'static [usize],
}

impl Slot {
    pub fn get<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        self.path
            .iter()
            .try_fold(value, |current, index| current.as_array()?.get(*index))
    }

    pub fn str<'a>(&self, value: &'a Value) -> Option<&'a str> {
        self.get(value).and_then(Value::as_str)
    }

    pub fn array<'a>(&self, value: &'a Value) -> Option<&'a Vec<Value>> {
        self.get(value).and_then(Value::as_array)
    }

    pub fn i64(&self, value: &Value) -> Option<i64> {
        self.get(value).and_then(Value::as_i64)
    }

    /// Non-empty string at this slot.
    pub fn text<'a>(&self, value: &'a Value) -> Option<&'a str> {
        self.str(value).filter(|text| !text.is_empty())
    }

    /// Non-empty array at this slot.
    pub fn items<'a>(&self, value: &'a Value) -> Option<&'a Vec<Value>> {
        self.array(value).filter(|items| !items.is_empty())
    }

    pub fn require<'a>(&self, value: &'a Value) -> Result<&'a Value> {
        self.get(value)
            .filter(|found| !found.is_null())
            .ok_or_else(|| GeminiError::parse(self.describe(), "missing value"))
    }

    pub fn require_str<'a>(&self, value: &'a Value) -> Result<&'a str> {
        self.require(value)?
            .as_str()
            .ok_or_else(|| GeminiError::parse(self.describe(), "expected a string"))
    }

    pub fn require_array<'a>(&self, value: &'a Value) -> Result<&'a Vec<Value>> {
        self.require(value)?
            .as_array()
            .ok_or_else(|| GeminiError::parse(self.describe(), "expected an array"))
    }

    /// `NAME[a][b]`, used in parse errors.
    pub fn describe(&self) -> String {
        let mut out = self.name.to_string();
        for index in self.path {
            out.push_str(&format!("[{index}]"));
        }
        out
    }
}

macro_rules! slots {
    ($($(#[$meta:meta])* $name:ident => [$($index:expr),+ $(,)?];)*) => {
        $(
            $(#[$meta])*
            pub const $name: Slot = Slot {
                name: stringify!($name),
                path: &[$($index),+],
            };
        )*

        pub const ALL_SLOTS: &[Slot] = &[$($name),*];
    };
}

slots! {
    /// Reply entry: the nested body as a JSON string.
    ENTRY_BODY => [2];
    /// Reply entry: in-band status block of a batch entry.
    ENTRY_STATUS => [5];

    /// Generate body: `[cid, rid, ...]`.
    BODY_METADATA => [1];
    BODY_CANDIDATES => [4];

    CANDIDATE_RCID => [0];
    CANDIDATE_TEXT => [1, 0];
    /// Replacement text when the primary text is a card-content placeholder.
    CANDIDATE_CARD_TEXT => [22, 0];
    CANDIDATE_THOUGHTS => [37, 0, 0];
    CANDIDATE_WEB_IMAGES => [12, 1];
    CANDIDATE_GENERATED_IMAGES => [12, 7, 0];

    WEB_IMAGE_URL => [0, 0, 0];
    WEB_IMAGE_TITLE => [7, 0];
    WEB_IMAGE_ALT => [0, 4];

    GENERATED_IMAGE_URL => [0, 3, 3];
    GENERATED_IMAGE_NUMBER => [3, 6];
    GENERATED_IMAGE_ALTS => [3, 5];

    /// Response line: detailed service error code.
    LINE_ERROR_CODE => [0, 5, 2, 0, 1, 0];
    /// Response line: bare status code of the first entry.
    LINE_STATUS_CODE => [0, 5, 0];

    /// Gem list reply: the gem entries.
    GEM_LIST => [2];
    GEM_ID => [0];
    GEM_NAME => [1, 0];
    GEM_DESCRIPTION => [1, 1];
    GEM_PROMPT => [2, 0];

    /// Create-gem reply: the new gem id.
    CREATED_GEM_ID => [0];
}
