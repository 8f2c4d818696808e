/// How transient, locally known state combines with an authoritative list.
///
/// `patch` overrides fields of persisted items in place (keyed overlays), `trailing`
/// yields items that are not persisted yet and render after every persisted one.
pub trait OverlayPolicy<T> {
    fn patch(&self, _item: &mut T) {}

    fn trailing(&self) -> Vec<T> {
        Vec::new()
    }
}

/// Merges `persisted` with `policy` into one display list.
///
/// Persisted order is kept as is; the policy never removes or reorders persisted items.
pub fn reconcile<T, P>(persisted: &[T], policy: &P) -> Vec<T>
where
    T: Clone,
    P: OverlayPolicy<T> + ?Sized,
{
    let mut merged = Vec::with_capacity(persisted.len());
    for item in persisted {
        let mut item = item.clone();
        policy.patch(&mut item);
        merged.push(item);
    }
    merged.extend(policy.trailing());
    merged
}
