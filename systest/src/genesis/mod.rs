//! Genesis edits before chain start.
//!
//! Edits run against node 0's `genesis.json`, in order, each seeing the
//! previous one's result. A batch either applies completely (and is copied
//! to every node) or leaves the document byte-identical to before.

pub mod accounts;
pub mod edits;

use std::fs;
use std::path::Path;

use serde_json::Value;
use systest_common::{HarnessError, HarnessResult, LogLevel, LogSource};

use crate::binary::CommandResult;
use crate::process::ProcessController;

pub use accounts::{
    Account, AccountKind, Balance, BaseAccount, BaseVestingAccount, ContinuousVestingAccount,
    DelayedVestingAccount, GenesisDocument, GenesisValidator,
};
pub use edits::{AddGenesisAccount, JsonEdit, set_path, set_unbonding_time, set_voting_period};

/// Applies edit batches to the shared genesis document.
pub struct GenesisMutator<'a> {
    controller: &'a mut ProcessController,
}

impl<'a> GenesisMutator<'a> {
    pub fn new(controller: &'a mut ProcessController) -> Self {
        Self { controller }
    }

    fn ensure_editable(&self, operation: &str) -> HarnessResult<()> {
        match self.controller.genesis_edit_blocker() {
            None => Ok(()),
            Some(state) => Err(HarnessError::InvalidPhase {
                operation: operation.to_string(),
                phase: state.to_string(),
            }),
        }
    }

    /// Run each edit command with `--home <node0>` appended.
    pub fn modify_cli(&mut self, edits: &[Vec<String>]) -> HarnessResult<()> {
        self.ensure_editable("modify genesis")?;
        if edits.is_empty() {
            return Ok(());
        }

        let genesis = self.controller.genesis_path(0)?;
        let backup = fs::read(&genesis)?;
        let home = self.controller.node_home(0)?.to_string_lossy().into_owned();

        for (step, edit) in edits.iter().enumerate() {
            let mut args = edit.clone();
            args.push("--home".to_string());
            args.push(home.clone());

            let applied = self.run_edit(&args).and_then(|_| read_json_object(&genesis));
            if let Err(err) = applied {
                self.controller.logger().log(
                    LogLevel::Error,
                    LogSource::Genesis,
                    format!(
                        "edit {} of {} failed, restoring genesis: {err}",
                        step + 1,
                        edits.len()
                    ),
                );
                fs::write(&genesis, &backup)?;
                return Err(err);
            }
        }

        self.commit(edits.len())
    }

    /// Apply in-process edits to the parsed document and write it back.
    pub fn modify_json(&mut self, edits: Vec<JsonEdit>) -> HarnessResult<()> {
        self.ensure_editable("modify genesis")?;
        if edits.is_empty() {
            return Ok(());
        }

        let genesis = self.controller.genesis_path(0)?;
        let mut doc = read_json_object(&genesis)?;
        let count = edits.len();
        for edit in edits {
            edit(&mut doc)?;
        }
        if !doc.is_object() {
            return Err(HarnessError::state("genesis edit replaced the document root"));
        }
        let mut pretty = serde_json::to_vec_pretty(&doc)?;
        pretty.push(b'\n');
        fs::write(&genesis, pretty)?;

        self.commit(count)
    }

    /// Node 0's current genesis, as stored on disk.
    pub fn read(&self) -> HarnessResult<Vec<u8>> {
        read_genesis(&*self.controller)
    }

    pub fn document(&self) -> HarnessResult<GenesisDocument> {
        GenesisDocument::parse(&self.read()?)
    }

    fn run_edit(&self, args: &[String]) -> HarnessResult<CommandResult> {
        let binary = self.controller.binary();
        let timeout = self.controller.config().command_timeout;
        self.controller.logger().log(
            LogLevel::Debug,
            LogSource::Genesis,
            format!("{} {}", binary.name(), args.join(" ")),
        );
        binary.exec(args, timeout)?.ensure_success()
    }

    /// Copy node 0's document to every other node.
    fn commit(&mut self, edit_count: usize) -> HarnessResult<()> {
        let source = self.controller.genesis_path(0)?;
        for index in 1..self.controller.node_count() {
            fs::copy(&source, self.controller.genesis_path(index)?)?;
        }
        self.controller.mark_configured();
        self.controller.logger().log(
            LogLevel::Info,
            LogSource::Genesis,
            format!(
                "applied {edit_count} genesis edit(s) to {} node(s)",
                self.controller.node_count()
            ),
        );
        Ok(())
    }
}

/// Node 0's genesis bytes; readable in every phase after setup.
pub fn read_genesis(controller: &ProcessController) -> HarnessResult<Vec<u8>> {
    Ok(fs::read(controller.genesis_path(0)?)?)
}

fn read_json_object(path: &Path) -> HarnessResult<Value> {
    let raw = fs::read(path)?;
    let value: Value = serde_json::from_slice(&raw).map_err(|e| {
        HarnessError::state(format!("{} is not valid JSON: {e}", path.display()))
    })?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(HarnessError::state(format!(
            "{} is not a JSON object",
            path.display()
        )))
    }
}
