//! Identity registry and signature oracle
//!
//! Agents register once with a name and an `ed25519:<base64>` public key.
//! Registration also opens the agent's bank account in the same transaction.
//! Every other mutation in the system is accepted only after `verify`
//! succeeds over the canonical bytes of the request.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use tracing::info;

use agora_core::{id, EconomyError, EconomyResult};

use crate::bank::BankService;
use crate::events::{EventLog, EventPayload};
use crate::models::Agent;
use crate::store::Store;

/// Algorithm tag accepted in v1
const KEY_ALGORITHM: &str = "ed25519";

/// Agent registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAgentRequest {
    pub name: String,
    /// `ed25519:<base64 of 32 key bytes>`
    pub public_key: String,
}

#[derive(Clone)]
pub struct IdentityService {
    store: Store,
    events: EventLog,
}

impl IdentityService {
    pub fn new(store: Store, events: EventLog) -> Self {
        Self { store, events }
    }

    /// Register a new agent and open its account. The public key must be
    /// unused; re-registration of the same key fails with `duplicate_key`.
    pub async fn register(&self, request: RegisterAgentRequest) -> EconomyResult<Agent> {
        if request.name.trim().is_empty() {
            return Err(EconomyError::validation("agent name cannot be empty"));
        }
        decode_public_key(&request.public_key)?;

        let agent = Agent {
            agent_id: id::fresh(id::AGENT),
            name: request.name,
            public_key: request.public_key,
            registered_at: Utc::now(),
        };

        let mut tx = self.store.begin().await?;

        let duplicate = sqlx::query("SELECT agent_id FROM identity_agents WHERE public_key = ?")
            .bind(&agent.public_key)
            .fetch_optional(&mut *tx)
            .await?;
        if duplicate.is_some() {
            return Err(EconomyError::DuplicateKey);
        }

        // The unique index is the backstop for a concurrent registration
        // with the same key.
        sqlx::query(
            "INSERT INTO identity_agents (agent_id, name, public_key, registered_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&agent.agent_id)
        .bind(&agent.name)
        .bind(&agent.public_key)
        .bind(agent.registered_at)
        .execute(&mut *tx)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.message().contains("UNIQUE") => {
                EconomyError::DuplicateKey
            }
            _ => err.into(),
        })?;

        let registered = EventLog::append(
            &mut tx,
            EventPayload::AgentRegistered {
                agent_id: agent.agent_id.clone(),
                name: agent.name.clone(),
            },
        )
        .await?;

        // One account per agent, opened with the registration itself.
        let (_, account_event) = BankService::open_account_in(&mut tx, &agent.agent_id).await?;

        tx.commit().await?;
        self.events
            .publish_all([registered].into_iter().chain(account_event));

        info!(agent_id = %agent.agent_id, name = %agent.name, "agent registered");
        Ok(agent)
    }

    /// Resolve an agent by id
    pub async fn lookup(&self, agent_id: &str) -> EconomyResult<Agent> {
        id::ensure(id::AGENT, agent_id, "agent")?;
        sqlx::query_as::<_, Agent>(
            "SELECT agent_id, name, public_key, registered_at
             FROM identity_agents WHERE agent_id = ?",
        )
        .bind(agent_id)
        .fetch_optional(self.store.pool())
        .await?
        .ok_or_else(|| EconomyError::not_found(format!("agent {}", agent_id)))
    }

    /// Verify a detached signature over `message` for `agent_id`.
    ///
    /// Pure in (key, bytes, signature); an unknown agent is an auth error
    /// rather than `false`, so callers can distinguish the two.
    pub async fn verify(
        &self,
        agent_id: &str,
        message: &[u8],
        signature_b64: &str,
    ) -> EconomyResult<bool> {
        let agent = self.lookup(agent_id).await.map_err(|err| match err {
            EconomyError::NotFound(what) => EconomyError::unauthorized(format!(
                "{} is not registered",
                what
            )),
            other => other,
        })?;

        let key = decode_public_key(&agent.public_key)?;
        let signature_bytes = BASE64
            .decode(signature_b64)
            .map_err(|_| EconomyError::validation("signature is not valid base64"))?;
        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|_| EconomyError::validation("signature has wrong length"))?;

        Ok(key.verify(message, &signature).is_ok())
    }
}

/// Parse `<algo>:<base64>` and decode the 32 key bytes
fn decode_public_key(stored: &str) -> EconomyResult<VerifyingKey> {
    let (algo, material) = stored
        .split_once(':')
        .ok_or_else(|| EconomyError::validation("public key must be <algo>:<base64>"))?;
    if algo != KEY_ALGORITHM {
        return Err(EconomyError::validation(format!(
            "unsupported key algorithm: {}",
            algo
        )));
    }
    let bytes = BASE64
        .decode(material)
        .map_err(|_| EconomyError::validation("public key material is not valid base64"))?;
    let array: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| EconomyError::validation("ed25519 public key must be 32 bytes"))?;
    VerifyingKey::from_bytes(&array)
        .map_err(|_| EconomyError::validation("public key is not a valid ed25519 point"))
}
