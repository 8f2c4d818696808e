use snafu::Snafu;

/// Reason reported when the user dismisses the file picker.
pub const NO_FILE_SELECTED_REASON: &str = "No file selected";

/// Failure half of every backend command.
///
/// A command either resolves to its payload or to exactly one of these variants. The
/// `Display` output is the human-readable reason shown to the user.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CommandError {
    #[snafu(display("No file selected"))]
    Cancelled { stage: &'static str },
    #[snafu(display("{entity} '{id}' was not found"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("{details}"))]
    InvalidInput {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("{reason}"))]
    Unavailable {
        stage: &'static str,
        reason: String,
    },
}

impl CommandError {
    pub fn reason(&self) -> String {
        self.to_string()
    }

    /// User-cancelled failures are never surfaced.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::Cancelled { stage }
            | Self::NotFound { stage, .. }
            | Self::InvalidInput { stage, .. }
            | Self::Unavailable { stage, .. } => stage,
        }
    }
}

pub type CommandResult<T> = Result<T, CommandError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum IdError {
    #[snafu(display("identifier '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_reason_matches_picker_contract() {
        let error = CancelledSnafu { stage: "pick-file" }.build();

        assert!(error.is_cancelled());
        assert_eq!(error.reason(), NO_FILE_SELECTED_REASON);
        assert_eq!(error.stage(), "pick-file");
    }

    #[test]
    fn unavailable_reason_is_passed_through_verbatim() {
        let error = UnavailableSnafu {
            stage: "ingest",
            reason: "corrupt file",
        }
        .build();

        assert!(!error.is_cancelled());
        assert_eq!(error.reason(), "corrupt file");
    }
}
