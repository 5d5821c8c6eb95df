//! Ready-made genesis edits, as CLI argument lists or in-process JSON edits.

use std::time::Duration;

use serde_json::{Map, Value};
use systest_common::{HarnessError, HarnessResult};

/// An in-process edit applied to the parsed genesis document.
pub type JsonEdit = Box<dyn FnOnce(&mut Value) -> HarnessResult<()> + Send>;

/// Builder for `genesis add-genesis-account`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddGenesisAccount {
    address: String,
    coins: String,
    vesting_amount: Option<String>,
    vesting_start_time: Option<i64>,
    vesting_end_time: Option<i64>,
}

impl AddGenesisAccount {
    pub fn new(address: impl Into<String>, coins: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            coins: coins.into(),
            vesting_amount: None,
            vesting_start_time: None,
            vesting_end_time: None,
        }
    }

    pub fn vesting_amount(mut self, coins: impl Into<String>) -> Self {
        self.vesting_amount = Some(coins.into());
        self
    }

    /// Unix seconds; with an end time this makes a continuous account.
    pub fn vesting_start_time(mut self, unix: i64) -> Self {
        self.vesting_start_time = Some(unix);
        self
    }

    /// Unix seconds.
    pub fn vesting_end_time(mut self, unix: i64) -> Self {
        self.vesting_end_time = Some(unix);
        self
    }

    pub fn into_args(self) -> Vec<String> {
        let mut args = vec![
            "genesis".to_string(),
            "add-genesis-account".to_string(),
            self.address,
            self.coins,
        ];
        if let Some(amount) = self.vesting_amount {
            args.push(format!("--vesting-amount={amount}"));
        }
        if let Some(start) = self.vesting_start_time {
            args.push(format!("--vesting-start-time={start}"));
        }
        if let Some(end) = self.vesting_end_time {
            args.push(format!("--vesting-end-time={end}"));
        }
        args
    }
}

/// Set `path` (dot-separated) to `value`, creating intermediate objects.
pub fn set_path(path: &str, value: Value) -> JsonEdit {
    let path = path.to_string();
    Box::new(move |doc: &mut Value| -> HarnessResult<()> {
        let mut segments: Vec<&str> = path.split('.').collect();
        let last = segments
            .pop()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HarnessError::state("empty genesis path"))?;
        let mut current = doc;
        for segment in segments {
            let map = current
                .as_object_mut()
                .ok_or_else(|| HarnessError::state(format!("`{segment}` parent is not an object")))?;
            current = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        current
            .as_object_mut()
            .ok_or_else(|| HarnessError::state(format!("cannot set `{path}`: parent is not an object")))?
            .insert(last.to_string(), value);
        Ok(())
    })
}

/// Go-style duration string (`"30s"`) for proto JSON duration fields.
fn proto_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs.fract() == 0.0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{secs}s")
    }
}

/// Shorten unbonding so undelegations mature within a test.
pub fn set_unbonding_time(duration: Duration) -> JsonEdit {
    set_path(
        "app_state.staking.params.unbonding_time",
        Value::String(proto_duration(duration)),
    )
}

pub fn set_voting_period(duration: Duration) -> JsonEdit {
    set_path(
        "app_state.gov.params.voting_period",
        Value::String(proto_duration(duration)),
    )
}
