use std::sync::Arc;

use console::style;

use crate::adapter::ChainAdapter;
use crate::config::Config;
use crate::error::JournalError;
use crate::executor::{CancelHandle, DeploymentReport, Executor};
use crate::graph::DeploymentGraph;
use crate::journal::{FileStore, Journal, JournalStore};
use crate::module::Module;
use crate::parameters::Parameters;

/// Entry point tying a module, its parameters, a journal store and a chain
/// adapter together.
///
/// ```rust,no_run
/// # use kidou::{ChainAdapter, Config, Deployment, build_module};
/// # fn adapter() -> Box<dyn ChainAdapter> { unimplemented!() }
/// let module = build_module("TitanSentaraModule", |m| {
///     let titan = m.contract("TitanSentara").deploy()?;
///     m.export("TitanSentara", &titan)?;
///     Ok(())
/// });
///
/// let deployment = Deployment::new(Config::from_json_file("kidou.json")?);
/// let report = deployment.deploy(&module, "chain-31337", adapter().as_ref())?;
///
/// println!("{:?}", report.address("TitanSentara"));
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct Deployment {
    config: Config,
    store: Arc<dyn JournalStore>,
    cancel: CancelHandle,
}

impl Deployment {
    /// Journals are kept in files under `config.journal_dir`.
    pub fn new(config: Config) -> Self {
        let store = FileStore::new(config.journal_dir.clone());
        Self::with_store(config, store)
    }

    pub fn with_store(config: Config, store: impl JournalStore + 'static) -> Self {
        Self {
            config,
            store: Arc::new(store),
            cancel: CancelHandle::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Adds parameters on top of those from the config.
    pub fn parameters(mut self, parameters: Parameters) -> Self {
        self.config.parameters.merge(parameters);
        self
    }

    /// Handle cancelling any attempt started through this deployment.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Builds the graph of `module` without executing anything.
    pub fn plan(&self, module: &Module) -> anyhow::Result<DeploymentGraph> {
        Ok(module.build(&self.config.parameters)?)
    }

    /// Runs one attempt of deploying `module` as `instance`.
    ///
    /// Running the same module against the same instance again resumes from
    /// the journal. Fatal errors (declaration problems, cycles, lock
    /// contention, journal failures) are returned as errors; the typed error
    /// can be recovered with `downcast_ref`.
    pub fn deploy(
        &self,
        module: &Module,
        instance: &str,
        adapter: &dyn ChainAdapter,
    ) -> anyhow::Result<DeploymentReport> {
        eprintln!(
            "Deploying {} as {}.",
            style(module.id()).red(),
            style(instance).blue()
        );

        let graph = self.plan(module)?;
        let journal = match Journal::open(self.store.as_ref(), instance) {
            Err(JournalError::Concurrent(err)) => return Err(err.into()),
            journal => journal?,
        };

        let report = Executor::new(adapter, journal)
            .max_in_flight(self.config.max_in_flight)
            .with_cancel_handle(self.cancel.clone())
            .run(&graph)?;

        if !report.skipped.is_empty() {
            eprintln!(
                "Skipped {} already deployed, retried {}.",
                style(report.skipped.len()).green(),
                style(report.retried.len()).yellow()
            );
        }

        for (node, err) in &report.failed {
            eprintln!("{} {node}: {err}", style("failed").red());
        }

        Ok(report)
    }
}

impl std::fmt::Debug for Deployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployment")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;
    use serde_json::json;

    use super::*;
    use crate::error::{BuildError, ConcurrentDeploymentError, DeclarationError};
    use crate::journal::MemoryStore;
    use crate::module::build_module;
    use crate::testing::ScriptedAdapter;

    fn token() -> Module {
        build_module("Token", |m| {
            let supply = m.parameter("supply")?;
            let token = m.contract("Token").arg(&supply).deploy()?;
            m.export("Token", &token)?;
            Ok(())
        })
    }

    #[test]
    fn test_missing_parameter_is_fatal() {
        let deployment = Deployment::with_store(Config::default(), MemoryStore::new());
        let adapter = ScriptedAdapter::new();

        let err = deployment.deploy(&token(), "local", &adapter).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::Declaration(DeclarationError::MissingParameter { .. }))
        ));
        assert!(adapter.invoked().is_empty());
    }

    #[test]
    fn test_swallowed_declaration_error_is_never_executed() {
        let module = build_module("M", |m| {
            m.contract("A").deploy()?;
            let _ = m.contract("A").deploy();
            Ok(())
        });
        let store = MemoryStore::new();
        let deployment = Deployment::with_store(Config::default(), store.clone());
        let adapter = ScriptedAdapter::new();

        let err = deployment.deploy(&module, "local", &adapter).unwrap_err();

        assert_eq!(
            err.downcast_ref::<BuildError>(),
            Some(&BuildError::Declaration(DeclarationError::DuplicateId(
                "M#A".into()
            )))
        );
        assert!(adapter.invoked().is_empty());
        assert!(store.entries("local").is_empty());
    }

    #[test]
    fn test_parameters_from_config() {
        let config =
            Config::from_json_str(r#"{ "parameters": { "Token": { "supply": 21 } } }"#).unwrap();
        let deployment = Deployment::with_store(config, MemoryStore::new());
        let adapter = ScriptedAdapter::new().succeed("Token#Token", "0xT");

        let report = deployment.deploy(&token(), "local", &adapter).unwrap();

        assert_eq!(adapter.invocations()[0].args, vec![json!(21)]);
        assert_eq!(report.address("Token").unwrap().as_str(), "0xT");
    }

    #[test]
    fn test_file_backed_resume() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            journal_dir: Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
            ..Config::default()
        };

        let mut parameters = Parameters::new();
        parameters.set_global("supply", 1);
        let deployment = Deployment::new(config).parameters(parameters);

        let adapter = ScriptedAdapter::new();
        assert!(deployment.deploy(&token(), "local", &adapter).unwrap().is_success());

        let adapter = ScriptedAdapter::new();
        let report = deployment.deploy(&token(), "local", &adapter).unwrap();
        assert!(report.is_success());
        assert!(adapter.invoked().is_empty());
        assert_eq!(report.skipped.len(), 1);
    }

    #[test]
    fn test_lock_contention_is_distinct() {
        let store = MemoryStore::new();
        let _held = Journal::open(&store, "local").unwrap();

        let mut parameters = Parameters::new();
        parameters.set("Token", "supply", 1);
        let deployment =
            Deployment::with_store(Config::default(), store.clone()).parameters(parameters);

        let err = deployment
            .deploy(&token(), "local", &ScriptedAdapter::new())
            .unwrap_err();

        let err = err
            .downcast_ref::<ConcurrentDeploymentError>()
            .expect("lock contention surfaces as its own error");
        assert_eq!(err.instance, "local");
    }
}
