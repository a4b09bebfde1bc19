//! Built-in module catalog
//!
//! The several hundred thin integration modules (social, content, ai, ...)
//! live outside the core and register through the same surface. What ships
//! here is the utility set the engine itself is tested against.

mod data;
mod http;
mod utilities;

use crate::registry::ModuleFn;

/// Everything the preload walk registers, by category
///
/// Each entry is `(dotted_name, Ok(handler) | Err(load_failure))`. Built-ins
/// never fail to load; the error arm exists for integration categories whose
/// modules can be broken individually without poisoning the catalog.
pub fn catalog() -> Vec<(String, Result<ModuleFn, String>)> {
    let mut modules = Vec::new();
    utilities::register(&mut modules);
    data::register(&mut modules);
    http::register(&mut modules);
    modules
}

/// Helper for category files: wrap an async fn as a catalog entry
pub(crate) fn entry<F, Fut>(
    modules: &mut Vec<(String, Result<ModuleFn, String>)>,
    name: &str,
    handler: F,
) where
    F: Fn(serde_json::Value, crate::registry::ModuleContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = crate::registry::ModuleResult> + Send + 'static,
{
    let handler: ModuleFn =
        std::sync::Arc::new(move |inputs, ctx| Box::pin(handler(inputs, ctx)));
    modules.push((name.to_string(), Ok(handler)));
}
