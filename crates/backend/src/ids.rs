use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use uuid::Uuid;

use super::error::{IdError, InvalidIdSnafu};

// One macro so every record id parses, prints and serializes the same way.
macro_rules! define_record_id {
    ($name:ident, $id_type:literal) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new(raw: Uuid) -> Self {
                Self(raw)
            }

            pub fn new_v4() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn parse(raw: &str) -> Result<Self, IdError> {
                let parsed = Uuid::parse_str(raw).context(InvalidIdSnafu {
                    stage: "parse-record-id",
                    id_type: $id_type,
                    raw: raw.to_string(),
                })?;
                Ok(Self(parsed))
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self::new(value)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(raw: &str) -> Result<Self, IdError> {
                Self::parse(raw)
            }
        }
    };
}

define_record_id!(NotebookId, "notebook-id");
define_record_id!(ChatEntryId, "chat-entry-id");
define_record_id!(AttachmentId, "attachment-id");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_display_output() {
        let id = AttachmentId::new_v4();
        let parsed: AttachmentId = id.to_string().parse().expect("display output parses");
        assert_eq!(parsed, id);
    }

    #[test]
    fn parse_rejects_garbage_with_typed_error() {
        let error = NotebookId::parse("not-a-uuid").expect_err("garbage must not parse");
        let message = error.to_string();
        assert!(message.contains("not-a-uuid"));
        assert!(message.contains("notebook-id"));
    }
}
