/// The owner of a set of feeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
    /// Locale used for error messages stored on feeds, e.g. `fr_FR`.
    pub language: String,
}

impl User {
    #[must_use]
    pub fn new(id: i64, username: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            language: language.into(),
        }
    }
}
