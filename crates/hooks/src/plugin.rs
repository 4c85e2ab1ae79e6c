//! Named plugins that install hooks into a pipeline

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{info, warn};

use crate::error::{HookError, HookResult};
use crate::pipeline::{HookFuture, HookPipeline, panic_message};

/// A bundle of hooks installed under one name.
///
/// `install` usually calls [`HookPipeline::register_hooks`] with
/// [`Plugin::name`]; the pipeline removes those hooks again on uninstall or
/// when install fails.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn install<'a>(&'a self, pipeline: &'a HookPipeline) -> HookFuture<'a, HookResult<()>>;

    fn uninstall<'a>(&'a self, _pipeline: &'a HookPipeline) -> HookFuture<'a, HookResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

impl HookPipeline {
    /// Register `plugin` and run its install step.
    ///
    /// A second plugin with the same name is ignored. If install fails or
    /// panics, the plugin and any hooks it already registered are removed
    /// and the error is returned.
    pub async fn use_plugin(&self, plugin: Arc<dyn Plugin>) -> HookResult<()> {
        let name = plugin.name().to_string();
        {
            let mut plugins = self.plugins().lock();
            if plugins.iter().any(|p| p.name() == name) {
                warn!(plugin = %name, "plugin already installed");
                return Ok(());
            }
            plugins.push(Arc::clone(&plugin));
        }

        let outcome = match AssertUnwindSafe(plugin.install(self)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(HookError::Message(format!(
                "install panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        match outcome {
            Ok(()) => {
                info!(plugin = %name, version = plugin.version(), "plugin installed");
                Ok(())
            }
            Err(e) => {
                self.unregister_plugin(&name);
                warn!(plugin = %name, error = %e, "plugin install failed");
                Err(e)
            }
        }
    }

    /// Run `name`'s uninstall step (failures logged), then drop it and its hooks.
    ///
    /// Returns whether a plugin with that name was installed.
    pub async fn remove_plugin(&self, name: &str) -> bool {
        let plugin = self
            .plugins()
            .lock()
            .iter()
            .find(|p| p.name() == name)
            .cloned();
        let Some(plugin) = plugin else {
            return false;
        };

        match AssertUnwindSafe(plugin.uninstall(self)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(plugin = name, error = %e, "plugin uninstall failed"),
            Err(panic) => warn!(
                plugin = name,
                error = %panic_message(panic.as_ref()),
                "plugin uninstall panicked"
            ),
        }
        self.unregister_plugin(name);
        info!(plugin = name, "plugin removed");
        true
    }

    /// Installed plugin names, in installation order.
    pub fn list_plugins(&self) -> Vec<String> {
        self.plugins()
            .lock()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins().lock().iter().any(|p| p.name() == name)
    }

    fn unregister_plugin(&self, name: &str) {
        self.plugins().lock().retain(|p| p.name() != name);
        self.remove_hooks(name);
    }
}
