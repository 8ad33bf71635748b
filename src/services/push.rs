//! Web Push delivery against browser push endpoints with VAPID auth.

use anyhow::{Context, Result};
use base64ct::{Base64UrlUnpadded, Encoding};
use http::Uri;
use p256::ecdsa::SigningKey;
use p256::elliptic_curve::sec1::FromEncodedPoint;
use p256::EncodedPoint;
use reqwest::Client;
use web_push_native::jwt_simple::prelude::ES256KeyPair;
use web_push_native::{Auth, WebPushBuilder};

use crate::config::ServiceConfig;

/// Result of one push attempt. `Gone` means the endpoint told us the
/// subscription no longer exists and should be deactivated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    Gone,
    Rejected(String),
}

struct VapidIdentity {
    key_bytes: Vec<u8>,
    contact: String,
}

pub struct PushGateway {
    http: Client,
    vapid: Option<VapidIdentity>,
}

impl PushGateway {
    /// Builds the gateway from config. A present but malformed key is a
    /// startup error; an absent key leaves the gateway unconfigured and every
    /// delivery is recorded as such instead of attempted.
    pub fn from_config(http: Client, config: &ServiceConfig) -> Result<Self> {
        let vapid = match &config.vapid_private_key {
            Some(encoded) => {
                let key_bytes = Base64UrlUnpadded::decode_vec(encoded)
                    .context("FLYCAST_VAPID_PRIVATE_KEY is not base64url")?;
                ES256KeyPair::from_bytes(&key_bytes)
                    .map_err(|err| anyhow::anyhow!("invalid VAPID private key: {err}"))?;
                Some(VapidIdentity {
                    key_bytes,
                    contact: config.vapid_contact.clone(),
                })
            }
            None => None,
        };
        Ok(Self { http, vapid })
    }

    pub fn configured(&self) -> bool {
        self.vapid.is_some()
    }

    /// Base64url public key browsers need when subscribing.
    pub fn public_key_b64(&self) -> Result<Option<String>> {
        let Some(vapid) = &self.vapid else {
            return Ok(None);
        };
        let signing_key = SigningKey::from_slice(&vapid.key_bytes)
            .context("VAPID key bytes are not a P-256 scalar")?;
        let point = signing_key.verifying_key().to_encoded_point(false);
        Ok(Some(Base64UrlUnpadded::encode_string(point.as_bytes())))
    }

    /// Sends one payload to one subscription endpoint.
    pub async fn send(
        &self,
        endpoint: &str,
        p256dh: &str,
        auth: &str,
        payload: &[u8],
    ) -> Result<PushOutcome> {
        let Some(vapid) = &self.vapid else {
            anyhow::bail!("push gateway is not configured");
        };

        let uri: Uri = endpoint.parse().context("invalid subscription endpoint")?;

        let p256dh_bytes =
            Base64UrlUnpadded::decode_vec(p256dh).context("invalid p256dh encoding")?;
        let auth_bytes = Base64UrlUnpadded::decode_vec(auth).context("invalid auth encoding")?;

        let encoded_point =
            EncodedPoint::from_bytes(&p256dh_bytes).context("invalid p256dh point")?;
        let ua_public: p256::PublicKey = Option::from(p256::PublicKey::from_encoded_point(
            &encoded_point,
        ))
        .ok_or_else(|| anyhow::anyhow!("p256dh is not a valid P-256 public key"))?;

        let auth_array: [u8; 16] = auth_bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("auth secret must be 16 bytes"))?;
        let auth: Auth = auth_array.into();

        let key_pair = ES256KeyPair::from_bytes(&vapid.key_bytes)
            .map_err(|err| anyhow::anyhow!("failed to build VAPID key pair: {err}"))?;

        let request = WebPushBuilder::new(uri, ua_public, auth)
            .with_vapid(&key_pair, &vapid.contact)
            .build(payload.to_vec())
            .map_err(|err| anyhow::anyhow!("failed to build push request: {err}"))?;

        let (parts, body) = request.into_parts();
        let mut outgoing = self.http.post(parts.uri.to_string());
        for (name, value) in parts.headers.iter() {
            if let Ok(v) = value.to_str() {
                outgoing = outgoing.header(name.as_str(), v);
            }
        }

        let response = outgoing
            .body(body)
            .send()
            .await
            .context("push endpoint request failed")?;

        let status = response.status();
        if status.is_success() {
            Ok(PushOutcome::Delivered)
        } else if status.as_u16() == 404 || status.as_u16() == 410 {
            Ok(PushOutcome::Gone)
        } else {
            Ok(PushOutcome::Rejected(format!("HTTP {status}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;

    fn config_with_key(key: Option<String>) -> ServiceConfig {
        let mut config = ServiceConfig::for_tests();
        config.vapid_private_key = key;
        config
    }

    #[test]
    fn absent_key_leaves_gateway_unconfigured() {
        let gateway = PushGateway::from_config(Client::new(), &config_with_key(None)).unwrap();
        assert!(!gateway.configured());
        assert!(gateway.public_key_b64().unwrap().is_none());
    }

    #[test]
    fn malformed_key_fails_at_startup() {
        let config = config_with_key(Some("not-base64url-!!".to_string()));
        assert!(PushGateway::from_config(Client::new(), &config).is_err());
    }

    #[test]
    fn valid_key_exposes_uncompressed_public_point() {
        let scalar = [7u8; 32];
        let encoded = Base64UrlUnpadded::encode_string(&scalar);
        let gateway =
            PushGateway::from_config(Client::new(), &config_with_key(Some(encoded))).unwrap();
        assert!(gateway.configured());
        let public = gateway.public_key_b64().unwrap().unwrap();
        let decoded = Base64UrlUnpadded::decode_vec(&public).unwrap();
        assert_eq!(decoded.len(), 65);
        assert_eq!(decoded[0], 0x04);
    }
}
