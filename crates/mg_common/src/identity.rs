//! Identifiers for viewers, worlds and views.

use std::fmt::{Display, Formatter};

use kstring::KString;
use uuid::Uuid;

/// A connected client able to see overlays.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ViewerId(pub Uuid);

impl ViewerId {
    /// A fresh random identity.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for ViewerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// The host's identifier of a world (dimension).
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct WorldId(KString);

impl WorldId {
    /// Wraps a world name.
    pub fn new(name: &str) -> Self {
        Self(KString::from_ref(name))
    }

    /// The world name.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for WorldId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.as_str())
    }
}

/// Globally unique key of a view: the owning stage's name and the view's case-folded name.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ViewKey {
    stage: KString,
    view: KString,
}

impl ViewKey {
    /// Builds the key, folding the view name to lowercase.
    pub fn new(stage: &str, view: &str) -> Self {
        Self {
            stage: KString::from_ref(stage),
            view: fold_name(view),
        }
    }

    /// The owning stage's name.
    pub fn stage(&self) -> &str {
        self.stage.as_str()
    }

    /// The case-folded view name.
    pub fn view(&self) -> &str {
        self.view.as_str()
    }
}

impl Display for ViewKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.stage, self.view)
    }
}

/// View names are unique per stage regardless of case.
pub(crate) fn fold_name(name: &str) -> KString {
    KString::from_string(name.to_lowercase())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn view_keys_ignore_view_name_case() {
        assert_eq!(ViewKey::new("mine", "Ore"), ViewKey::new("mine", "ORE"));
        assert_ne!(ViewKey::new("mine", "ore"), ViewKey::new("Mine", "ore"));
        assert_eq!(ViewKey::new("mine", "Ore").to_string(), "mine/ore");
    }
}
