//! Per-device topic layout.
//!
//! ```text
//! <base>/<serial>/raw/<field>    fast loop, not retained
//! <base>/<serial>/data/<field>   slow loop, daily and reference values, retained
//! <base>/<serial>/lwt            liveness, retained
//! ```

/// Topic builder for one gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    raw: String,
    data: String,
    status: String,
}

impl TopicLayout {
    /// Creates the layout for `serial` under `base`.
    #[must_use]
    pub fn new(base: &str, serial: &str) -> Self {
        let root = format!("{}/{serial}", base.trim_end_matches('/'));
        Self {
            raw: format!("{root}/raw"),
            data: format!("{root}/data"),
            status: format!("{root}/lwt"),
        }
    }

    /// Topic of a fast-loop field.
    #[must_use]
    pub fn raw(&self, field: &str) -> String {
        format!("{}/{field}", self.raw)
    }

    /// Topic of a slow-loop, daily or reference field.
    #[must_use]
    pub fn data(&self, field: &str) -> String {
        format!("{}/{field}", self.data)
    }

    /// Liveness topic.
    #[must_use]
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Recovers the field key of a data topic.
    #[must_use]
    pub fn data_key<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.data.as_str())?
            .strip_prefix('/')
            .filter(|key| !key.is_empty() && !key.contains('/'))
    }
}
