//! Deploys the TitanSentara module against a dry-run adapter.
//!
//! ```sh
//! cargo run --example titan_sentara --features logging
//! ```
//!
//! Running it twice shows the second attempt skipping everything the first
//! one recorded in `.deployments/dry-run/journal.jsonl`.

use std::sync::atomic::{AtomicU64, Ordering};

use kidou::{
    Address, CallRequest, ChainAdapter, Config, DeployRequest, Deployment, ReadRequest,
    TransactionError, Value, build_module,
};

/// Pretends every action succeeds, handing out sequential addresses.
#[derive(Default)]
struct DryRun {
    next: AtomicU64,
}

impl ChainAdapter for DryRun {
    fn deploy_contract(&self, request: &DeployRequest) -> Result<Address, TransactionError> {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        println!("deploy {}({:?})", request.contract, request.args);
        Ok(Address::new(format!("0x{n:040x}")))
    }

    fn call(&self, request: &CallRequest) -> Result<Value, TransactionError> {
        println!("call {}.{}({:?})", request.address, request.method, request.args);
        Ok(Value::Null)
    }

    fn read(&self, request: &ReadRequest) -> Result<Value, TransactionError> {
        println!("read {}.{}()", request.address, request.method);
        Ok(Value::from(0))
    }
}

fn main() -> anyhow::Result<()> {
    #[cfg(feature = "logging")]
    kidou::init_logging();

    let module = build_module("TitanSentaraModule", |m| {
        let titan = m.contract("TitanSentara").deploy()?;
        m.export("TitanSentara", &titan)?;
        Ok(())
    });

    let deployment = Deployment::new(Config::default());
    let report = deployment.deploy(&module, "dry-run", &DryRun::default())?;

    for (name, value) in report.exports() {
        println!("{name}: {value}");
    }

    println!("{}", report.diagnostics.render_mermaid(&deployment.plan(&module)?));

    Ok(())
}
