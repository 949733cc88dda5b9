//! Macros for reducing boilerplate in the API layer.

/// Macro to implement `FromRef<AppState>` for a state component.
///
/// Lets handlers extract a single component with `State<T>` instead of
/// the whole `AppState`.
///
/// # Example
/// ```ignore
/// impl_from_ref!(Arc<AuthReplica>, replica);
/// // Expands to:
/// impl axum::extract::FromRef<AppState> for Arc<AuthReplica> {
///     fn from_ref(state: &AppState) -> Self {
///         state.replica.clone()
///     }
/// }
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
