//! Macros for reducing boilerplate in the server crate.

/// Implement `FromRef<AppState>` for a field of the state, so handlers can
/// extract just that field with `State<T>`.
///
/// # Example
/// ```ignore
/// impl_from_ref!(Arc<ChangeBroadcaster>, broadcaster);
/// ```
#[macro_export]
macro_rules! impl_from_ref {
    ($type:ty, $field:ident) => {
        impl axum::extract::FromRef<$crate::state::AppState> for $type {
            fn from_ref(state: &$crate::state::AppState) -> Self {
                state.$field.clone()
            }
        }
    };
}
