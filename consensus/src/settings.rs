//! Operator settings for the reactor.
//!
//! Settings are read from the host's configuration file (YAML or JSON) and converted into
//! the typed values consumed by [crate::reactor::Config] with [Settings::parse].

use crate::types::SigningThreshold;
use commonware_codec::DecodeExt;
use commonware_cryptography::PublicKey;
use commonware_utils::from_hex_formatted;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when parsing [Settings].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid signing threshold: {0}")]
    InvalidThreshold(String),
    #[error("invalid validator address: {0}")]
    InvalidAddress(String),
    #[error("invalid voting power for {0}: {1}")]
    InvalidVotingPower(String, i64),
    #[error("duplicate override validator: {0}")]
    DuplicateAddress(String),
}

/// A validator (and its voting power) that replaces the host validator set.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideValidator {
    /// Hex-encoded public key.
    pub address: String,
    pub voting_power: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub override_validators: Vec<OverrideValidator>,
    #[serde(default = "default_threshold")]
    pub fn_vote_signing_threshold: String,
}

fn default_threshold() -> String {
    SigningThreshold::Maj23.to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            override_validators: Vec::new(),
            fn_vote_signing_threshold: default_threshold(),
        }
    }
}

/// Typed [Settings].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Parsed<P: PublicKey> {
    pub override_validators: Vec<(P, u64)>,
    pub signing_threshold: SigningThreshold,
}

impl Settings {
    pub fn parse<P: PublicKey>(&self) -> Result<Parsed<P>, Error> {
        let signing_threshold = match self.fn_vote_signing_threshold.as_str() {
            "All" => SigningThreshold::All,
            "Maj23" => SigningThreshold::Maj23,
            other => return Err(Error::InvalidThreshold(other.to_string())),
        };

        let mut override_validators: Vec<(P, u64)> =
            Vec::with_capacity(self.override_validators.len());
        for validator in &self.override_validators {
            let public_key = from_hex_formatted(&validator.address)
                .and_then(|raw| P::decode(raw.as_ref()).ok())
                .ok_or_else(|| Error::InvalidAddress(validator.address.clone()))?;
            if validator.voting_power <= 0 {
                return Err(Error::InvalidVotingPower(
                    validator.address.clone(),
                    validator.voting_power,
                ));
            }
            if override_validators.iter().any(|(pk, _)| pk == &public_key) {
                return Err(Error::DuplicateAddress(validator.address.clone()));
            }
            override_validators.push((public_key, validator.voting_power as u64));
        }

        Ok(Parsed {
            override_validators,
            signing_threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_cryptography::{
        ed25519::{PrivateKey, PublicKey},
        PrivateKeyExt as _, Signer as _,
    };
    use commonware_utils::hex;

    #[test]
    fn test_defaults() {
        let settings: Settings = serde_yaml::from_str("{}").unwrap();
        assert_eq!(settings, Settings::default());
        let parsed = settings.parse::<PublicKey>().unwrap();
        assert_eq!(parsed.signing_threshold, SigningThreshold::Maj23);
        assert!(parsed.override_validators.is_empty());
    }

    #[test]
    fn test_yaml() {
        let public_key = PrivateKey::from_seed(0).public_key();
        let yaml = format!(
            "fnVoteSigningThreshold: All\noverrideValidators:\n  - address: \"0x{}\"\n    votingPower: 7\n",
            hex(public_key.as_ref())
        );
        let settings: Settings = serde_yaml::from_str(&yaml).unwrap();
        let parsed = settings.parse::<PublicKey>().unwrap();
        assert_eq!(parsed.signing_threshold, SigningThreshold::All);
        assert_eq!(parsed.override_validators, vec![(public_key, 7)]);
    }

    #[test]
    fn test_json() {
        let public_key = PrivateKey::from_seed(1).public_key();
        let json = format!(
            r#"{{"overrideValidators":[{{"address":"{}","votingPower":3}}]}}"#,
            hex(public_key.as_ref())
        );
        let settings: Settings = serde_json::from_str(&json).unwrap();
        let parsed = settings.parse::<PublicKey>().unwrap();
        assert_eq!(parsed.signing_threshold, SigningThreshold::Maj23);
        assert_eq!(parsed.override_validators, vec![(public_key, 3)]);
    }

    #[test]
    fn test_invalid() {
        let settings = Settings {
            fn_vote_signing_threshold: "Half".to_string(),
            ..Default::default()
        };
        assert_eq!(
            settings.parse::<PublicKey>(),
            Err(Error::InvalidThreshold("Half".to_string()))
        );

        let settings = Settings {
            override_validators: vec![OverrideValidator {
                address: "zz".to_string(),
                voting_power: 1,
            }],
            ..Default::default()
        };
        assert_eq!(
            settings.parse::<PublicKey>(),
            Err(Error::InvalidAddress("zz".to_string()))
        );

        let address = hex(PrivateKey::from_seed(2).public_key().as_ref());
        let settings = Settings {
            override_validators: vec![OverrideValidator {
                address: address.clone(),
                voting_power: 0,
            }],
            ..Default::default()
        };
        assert_eq!(
            settings.parse::<PublicKey>(),
            Err(Error::InvalidVotingPower(address.clone(), 0))
        );

        let settings = Settings {
            override_validators: vec![
                OverrideValidator {
                    address: address.clone(),
                    voting_power: 1,
                },
                OverrideValidator {
                    address: address.clone(),
                    voting_power: 2,
                },
            ],
            ..Default::default()
        };
        assert_eq!(
            settings.parse::<PublicKey>(),
            Err(Error::DuplicateAddress(address))
        );
    }
}
