use notebook_backend::CommandResult;

/// Sequence number attached to one fetch.
///
/// Only the completion carrying the newest issued ticket may replace the persisted list;
/// older completions lost the race and are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoadTicket(u64);

impl LoadTicket {
    pub fn sequence(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Replaced,
    Failed,
    Stale,
}

/// Authoritative list fetched on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loadable<T> {
    persisted: Option<Vec<T>>,
    issued: u64,
    in_flight: bool,
    last_error: Option<String>,
}

impl<T> Default for Loadable<T> {
    fn default() -> Self {
        Self {
            persisted: None,
            issued: 0,
            in_flight: false,
            last_error: None,
        }
    }
}

impl<T> Loadable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self) -> LoadTicket {
        self.issued = self.issued.saturating_add(1);
        self.in_flight = true;
        LoadTicket(self.issued)
    }

    /// Applies a fetch completion. Failures keep the previous list and record the reason.
    pub fn accept(&mut self, ticket: LoadTicket, result: CommandResult<Vec<T>>) -> LoadOutcome {
        if ticket.0 != self.issued {
            return LoadOutcome::Stale;
        }

        self.in_flight = false;
        match result {
            Ok(items) => {
                self.persisted = Some(items);
                self.last_error = None;
                LoadOutcome::Replaced
            }
            Err(error) => {
                self.last_error = Some(error.reason());
                LoadOutcome::Failed
            }
        }
    }

    pub fn items(&self) -> Option<&[T]> {
        self.persisted.as_deref()
    }

    pub fn items_mut(&mut self) -> Option<&mut Vec<T>> {
        self.persisted.as_mut()
    }

    pub fn is_loaded(&self) -> bool {
        self.persisted.is_some()
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use notebook_backend::error::UnavailableSnafu;

    use super::*;

    #[test]
    fn newest_ticket_replaces_list_wholesale() {
        let mut loadable = Loadable::new();
        let first = loadable.begin();
        assert_eq!(loadable.accept(first, Ok(vec![1, 2])), LoadOutcome::Replaced);

        let second = loadable.begin();
        assert_eq!(loadable.accept(second, Ok(vec![3])), LoadOutcome::Replaced);
        assert_eq!(loadable.items(), Some(&[3][..]));
    }

    #[test]
    fn superseded_ticket_is_discarded() {
        let mut loadable = Loadable::new();
        let older = loadable.begin();
        let newer = loadable.begin();

        assert_eq!(loadable.accept(newer, Ok(vec![2])), LoadOutcome::Replaced);
        assert_eq!(loadable.accept(older, Ok(vec![1])), LoadOutcome::Stale);
        assert_eq!(loadable.items(), Some(&[2][..]));
        assert!(!loadable.is_loading());
    }

    #[test]
    fn failure_keeps_previous_list_and_records_reason() {
        let mut loadable = Loadable::new();
        let ticket = loadable.begin();
        loadable.accept(ticket, Ok(vec![7]));

        let ticket = loadable.begin();
        let outcome = loadable.accept(
            ticket,
            UnavailableSnafu {
                stage: "test",
                reason: "database locked",
            }
            .fail(),
        );
        assert_eq!(outcome, LoadOutcome::Failed);
        assert_eq!(loadable.items(), Some(&[7][..]));
        assert_eq!(loadable.last_error(), Some("database locked"));
    }

    #[test]
    fn first_failure_leaves_list_unset() {
        let mut loadable = Loadable::<u8>::new();
        let ticket = loadable.begin();
        loadable.accept(
            ticket,
            UnavailableSnafu {
                stage: "test",
                reason: "offline",
            }
            .fail(),
        );
        assert!(!loadable.is_loaded());
        assert_eq!(loadable.last_error(), Some("offline"));
    }
}
