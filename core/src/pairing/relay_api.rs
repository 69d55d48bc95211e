//! Relay pairing HTTP API client
//!
//! Carries the remote 6-digit-code pairing mode: code creation and claim,
//! then challenge/ack hand-off while both devices poll their side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::DeviceId;
use crate::protocol::{PairingAck, PairingChallenge};
use crate::{Error, Result};

#[derive(Debug, Serialize)]
struct CreateCodeRequest<'a> {
    initiator_device_id: &'a DeviceId,
    initiator_device_name: &'a str,
    initiator_public_key: &'a str,
}

/// Response to code creation
#[derive(Debug, Clone, Deserialize)]
pub struct CodeGrant {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ClaimRequest<'a> {
    code: &'a str,
    responder_device_id: &'a DeviceId,
    responder_device_name: &'a str,
    responder_public_key: &'a str,
}

/// Initiator identity returned by a successful claim
#[derive(Debug, Clone, Deserialize)]
pub struct ClaimGrant {
    pub initiator_device_id: DeviceId,
    pub initiator_device_name: String,
    pub initiator_public_key: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct PostChallengeRequest<'a> {
    responder_device_id: &'a DeviceId,
    challenge: &'a PairingChallenge,
}

#[derive(Debug, Deserialize)]
struct GetChallengeResponse {
    challenge: PairingChallenge,
}

#[derive(Debug, Serialize)]
struct PostAckRequest<'a> {
    initiator_device_id: &'a DeviceId,
    ack: &'a PairingAck,
}

#[derive(Debug, Deserialize)]
struct GetAckResponse {
    ack: PairingAck,
}

/// Thin client over the relay's pairing endpoints
pub struct RelayPairingApi {
    base: url::Url,
    http: reqwest::Client,
}

impl RelayPairingApi {
    pub fn new(base: url::Url) -> Self {
        Self {
            base,
            http: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, path: &str) -> Result<url::Url> {
        self.base
            .join(path)
            .map_err(|e| Error::Network(e.to_string()))
    }

    /// `POST /pairing/code` — obtain a fresh 6-digit code (60 s TTL)
    pub async fn create_code(
        &self,
        device_id: &DeviceId,
        device_name: &str,
        public_key_b64: &str,
    ) -> Result<CodeGrant> {
        let response = self
            .http
            .post(self.endpoint("pairing/code")?)
            .json(&CreateCodeRequest {
                initiator_device_id: device_id,
                initiator_device_name: device_name,
                initiator_public_key: public_key_b64,
            })
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        parse_ok(response).await
    }

    /// `POST /pairing/claim` — redeem a code for the initiator's identity
    pub async fn claim_code(
        &self,
        code: &str,
        device_id: &DeviceId,
        device_name: &str,
        public_key_b64: &str,
    ) -> Result<ClaimGrant> {
        let response = self
            .http
            .post(self.endpoint("pairing/claim")?)
            .json(&ClaimRequest {
                code,
                responder_device_id: device_id,
                responder_device_name: device_name,
                responder_public_key: public_key_b64,
            })
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        match response.status().as_u16() {
            404 => Err(Error::InvalidMessage("pairing code not found".to_string())),
            409 => Err(Error::InvalidMessage(
                "pairing code already claimed".to_string(),
            )),
            410 => Err(Error::PayloadExpired),
            _ => parse_ok(response).await,
        }
    }

    /// `POST /pairing/code/{code}/challenge`
    pub async fn post_challenge(
        &self,
        code: &str,
        responder: &DeviceId,
        challenge: &PairingChallenge,
    ) -> Result<()> {
        let response = self
            .http
            .post(self.endpoint(&format!("pairing/code/{}/challenge", code))?)
            .json(&PostChallengeRequest {
                responder_device_id: responder,
                challenge,
            })
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        expect_ok(response).await
    }

    /// `GET /pairing/code/{code}/challenge` — `None` until the responder
    /// has posted one
    pub async fn get_challenge(
        &self,
        code: &str,
        initiator: &DeviceId,
    ) -> Result<Option<PairingChallenge>> {
        let mut url = self.endpoint(&format!("pairing/code/{}/challenge", code))?;
        url.query_pairs_mut()
            .append_pair("initiator_device_id", initiator.as_str());

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        parse_maybe(response, "challenge not available")
            .await
            .map(|opt: Option<GetChallengeResponse>| opt.map(|r| r.challenge))
    }

    /// `POST /pairing/code/{code}/ack`
    pub async fn post_ack(&self, code: &str, initiator: &DeviceId, ack: &PairingAck) -> Result<()> {
        let response = self
            .http
            .post(self.endpoint(&format!("pairing/code/{}/ack", code))?)
            .json(&PostAckRequest {
                initiator_device_id: initiator,
                ack,
            })
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        expect_ok(response).await
    }

    /// `GET /pairing/code/{code}/ack` — `None` until the initiator has
    /// posted one
    pub async fn get_ack(&self, code: &str, responder: &DeviceId) -> Result<Option<PairingAck>> {
        let mut url = self.endpoint(&format!("pairing/code/{}/ack", code))?;
        url.query_pairs_mut()
            .append_pair("responder_device_id", responder.as_str());

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        parse_maybe(response, "acknowledgement not available")
            .await
            .map(|opt: Option<GetAckResponse>| opt.map(|r| r.ack))
    }
}

async fn parse_ok<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Network(format!("relay returned {}: {}", status, body)));
    }
    response
        .json()
        .await
        .map_err(|e| Error::PayloadMalformed(e.to_string()))
}

async fn expect_ok(response: reqwest::Response) -> Result<()> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Network(format!("relay returned {}: {}", status, body)));
    }
    Ok(())
}

/// A 404 whose body names the not-ready marker means "poll again"; any
/// other failure is an error
async fn parse_maybe<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    not_ready_marker: &str,
) -> Result<Option<T>> {
    let status = response.status();
    if status.as_u16() == 404 {
        let body = response.text().await.unwrap_or_default();
        if body.contains(not_ready_marker) {
            return Ok(None);
        }
        return Err(Error::InvalidMessage("pairing code not found".to_string()));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Network(format!("relay returned {}: {}", status, body)));
    }
    response
        .json()
        .await
        .map(Some)
        .map_err(|e| Error::PayloadMalformed(e.to_string()))
}
