//! The seam between the transition pipeline and the contract execution engine.
//!
//! A [TxExecutor] applies one transaction to a [WorldState] and answers read-only queries against
//! a [ReadOnlyWorldState]. [BasicExecutor] covers value transfers and contract installation so
//! the pipeline can run without a real engine behind it.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::common::{Addr, Amount, Bytes, Hash};
use crate::error::{Error, Result};
use crate::receipt::Receipt;
use crate::state::contract::{CT_APP_JAVA, CT_APP_SYSTEM, CT_APP_ZIP};
use crate::state::{
    system_addr, ApiInfo, BlockInfo, ContractSnapshot, ContractState, EeType, ReadOnlyWorldState,
    WorldState,
};
use crate::trace::TraceLogger;
use crate::tx::{Transaction, TxKind, DATA_TYPE_CALL, DATA_TYPE_DEPLOY};

pub const STEP_DEFAULT: u64 = 100_000;
pub const STEP_PER_BYTE: u64 = 25;

#[async_trait]
pub trait TxExecutor: Send + Sync {
    /// Applies `tx` to `ws`. An `Err` means the transaction failed: the caller rolls the world
    /// back and records a failure receipt, unless the error is a critical I/O failure, which
    /// aborts the whole transition.
    async fn execute(
        &self, ws: &mut WorldState, tx: &Transaction, block: &BlockInfo, logger: &TraceLogger,
    ) -> Result<Receipt>;

    fn query(
        &self, ws: &ReadOnlyWorldState, to: &Addr, method: &str, params: &Value,
    ) -> Result<Value>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeployData {
    content_type: String,
    content: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    api: Option<ApiInfo>,
}

fn ee_type_of(content_type: &str) -> Result<EeType> {
    match content_type {
        CT_APP_ZIP => Ok(EeType::Python),
        CT_APP_JAVA => Ok(EeType::Java),
        CT_APP_SYSTEM => Ok(EeType::System),
        ct => Err(Error::InvalidTransaction(format!("unknown content type {}", ct))),
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    hex::decode(s.strip_prefix("0x").unwrap_or(s))
        .map_err(|e| Error::InvalidTransaction(e.to_string()))
}

/// Transfers and deployments only; contract methods are not interpreted.
#[derive(Default)]
pub struct BasicExecutor;

impl BasicExecutor {
    fn step_used(tx: &Transaction) -> Amount {
        Amount::from(STEP_DEFAULT + STEP_PER_BYTE * tx.data().len() as u64)
    }

    fn transfer(ws: &mut WorldState, from: &Addr, to: &Addr, value: &Amount) -> Result<()> {
        if value.is_zero() || from == to {
            return Ok(())
        }
        let remaining = ws
            .balance(from)
            .checked_sub(value)
            .ok_or_else(|| Error::Execution(format!("out of balance ({})", from)))?;
        let credited = ws
            .balance(to)
            .checked_add(value)
            .ok_or_else(|| Error::Execution("balance overflow".into()))?;
        ws.get_account(from).set_balance(remaining);
        ws.get_account(to).set_balance(credited);
        Ok(())
    }

    fn call(ws: &mut WorldState, tx: &Transaction, logger: &TraceLogger) -> Result<Receipt> {
        if tx.to().is_contract() && tx.to() != system_addr() {
            let active = ws
                .get_account_snapshot(tx.to())
                .and_then(|acc| acc.contract().map(|c| c.status() == ContractState::Active))
                .unwrap_or(false);
            if !active {
                return Err(Error::NoActiveContract(tx.to().to_string()))
            }
        }
        Self::transfer(ws, tx.from(), tx.to(), tx.value())?;
        logger.ttrace(format_args!("transfer {} from {} to {}", tx.value(), tx.from(), tx.to()));
        Ok(Receipt::success(*tx.id(), Self::step_used(tx)))
    }

    /// Installs a contract at a fresh address when sent to the system address, otherwise
    /// replaces the code of the contract at `to`.
    fn deploy(ws: &mut WorldState, tx: &Transaction, logger: &TraceLogger) -> Result<Receipt> {
        let data: DeployData = serde_json::from_slice(tx.data())
            .map_err(|e| Error::InvalidTransaction(format!("bad deploy data: {}", e)))?;
        let ee_type = ee_type_of(&data.content_type)?;
        let code = decode_hex(&data.content)?;
        if code.is_empty() {
            return Err(Error::InvalidTransaction("empty contract content".into()))
        }
        let params = match &data.params {
            Value::Null => Bytes::empty(),
            v => Bytes::from(v.to_string().into_bytes()),
        };
        let score = if tx.to() == system_addr() {
            Addr::for_contract(tx.from(), tx.id())
        } else {
            tx.to().clone()
        };
        Self::transfer(ws, tx.from(), &score, tx.value())?;

        let acc = ws.get_account(&score);
        match acc.contract_mut() {
            Some(contract) if tx.to() != system_addr() => {
                contract.set_code(code);
                contract.set_status(ContractState::Active, None);
            }
            Some(_) => return Err(Error::Execution(format!("contract {} exists", score))),
            None if tx.to() != system_addr() => {
                return Err(Error::NoActiveContract(score.to_string()))
            }
            None => acc.deploy_contract(ContractSnapshot::new(
                ContractState::Active,
                ee_type,
                &data.content_type,
                code,
                Some(*tx.id()),
                params,
            )),
        }
        if data.api.is_some() {
            acc.set_api_info(data.api);
        }
        logger.tsystem(format_args!("deployed {} by {}", score, tx.from()));
        Ok(Receipt::success(*tx.id(), Self::step_used(tx)).with_score_address(score))
    }
}

#[async_trait]
impl TxExecutor for BasicExecutor {
    async fn execute(
        &self, ws: &mut WorldState, tx: &Transaction, _block: &BlockInfo, logger: &TraceLogger,
    ) -> Result<Receipt> {
        if tx.kind() == TxKind::Patch {
            // patches steer the pipeline and leave the world untouched
            return Ok(Receipt::success(*tx.id(), Amount::default()))
        }
        match tx.data_type() {
            "" | DATA_TYPE_CALL => Self::call(ws, tx, logger),
            DATA_TYPE_DEPLOY => Self::deploy(ws, tx, logger),
            other => Err(Error::InvalidTransaction(format!("unknown data type {}", other))),
        }
    }

    fn query(
        &self, ws: &ReadOnlyWorldState, to: &Addr, method: &str, params: &Value,
    ) -> Result<Value> {
        let acc = ws.get_account(to);
        match method {
            "balance" => Ok(json!(acc.map(|a| a.balance().clone()).unwrap_or_default())),
            "codeHash" => {
                let contract = acc
                    .as_ref()
                    .and_then(|a| a.contract())
                    .ok_or_else(|| Error::NoActiveContract(to.to_string()))?;
                Ok(json!(contract.code_hash().copied().map(|h: Hash| h.to_string())))
            }
            "getVar" => {
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::InvalidQuery("missing name".into()))?;
                match acc.map(|a| a.get_var(name)).transpose()?.flatten() {
                    Some(v) => Ok(v.to_json()),
                    None => Ok(Value::Null),
                }
            }
            m => Err(Error::InvalidQuery(format!("unknown method {}", m))),
        }
    }
}
