//! L402 primitives used by the wordclaw payment gate and client tooling.
//!
//! A priced request that arrives without proof of payment is answered with a
//! `402` challenge: a capability token (the "macaroon") minted here plus a
//! BOLT11 invoice from the payment provider. The retry presents
//! `Authorization: L402 <token>:<preimage>`; [`TokenVerifier`] checks the
//! token signature and caveats, [`verify_preimage`] checks the payment proof.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const TOKEN_VERSION_PREFIX: &str = "v1";

/// Caveats bound into a capability token at mint time.
///
/// A verified token authorizes exactly one `(method, path)` for one tenant,
/// for the amount and payment hash it was minted against, until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCaveats {
    pub payment_hash: String,
    pub method: String,
    pub path: String,
    pub tenant_id: i64,
    pub amount_sats: i64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    #[serde(flatten)]
    caveats: TokenCaveats,
    jti: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature mismatch")]
    Signature,
    #[error("token expired at {0}")]
    Expired(DateTime<Utc>),
    #[error("token caveat does not match the request: {0}")]
    CaveatMismatch(&'static str),
}

/// Mints `v1.<claims>.<sig>` capability tokens with an HMAC-SHA256 signature
/// over the base64url claims segment.
#[derive(Clone)]
pub struct TokenMinter {
    signing_key: Vec<u8>,
}

impl TokenMinter {
    #[must_use]
    pub fn new(signing_key: &[u8]) -> Self {
        Self {
            signing_key: signing_key.to_vec(),
        }
    }

    pub fn mint(&self, caveats: TokenCaveats, jti: String) -> Result<String, TokenError> {
        let claims = TokenClaims { caveats, jti };
        let claims_bytes = serde_json::to_vec(&claims).map_err(|_| TokenError::Malformed)?;
        let claims_segment = URL_SAFE_NO_PAD.encode(claims_bytes);

        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .map_err(|_| TokenError::Malformed)?;
        mac.update(claims_segment.as_bytes());
        let signature_segment = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!(
            "{TOKEN_VERSION_PREFIX}.{claims_segment}.{signature_segment}"
        ))
    }
}

/// Verifies tokens produced by [`TokenMinter`] and enforces their caveats.
#[derive(Clone)]
pub struct TokenVerifier {
    signing_key: Vec<u8>,
}

impl TokenVerifier {
    #[must_use]
    pub fn new(signing_key: &[u8]) -> Self {
        Self {
            signing_key: signing_key.to_vec(),
        }
    }

    /// Check the signature and expiry, returning the embedded caveats.
    pub fn decode(&self, token: &str, now: DateTime<Utc>) -> Result<TokenCaveats, TokenError> {
        let mut segments = token.trim().split('.');
        let version = segments.next().ok_or(TokenError::Malformed)?;
        let claims_segment = segments.next().ok_or(TokenError::Malformed)?;
        let signature_segment = segments.next().ok_or(TokenError::Malformed)?;
        if version != TOKEN_VERSION_PREFIX || segments.next().is_some() {
            return Err(TokenError::Malformed);
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_segment)
            .map_err(|_| TokenError::Malformed)?;
        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .map_err(|_| TokenError::Malformed)?;
        mac.update(claims_segment.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::Signature)?;

        let claims_bytes = URL_SAFE_NO_PAD
            .decode(claims_segment)
            .map_err(|_| TokenError::Malformed)?;
        let claims: TokenClaims =
            serde_json::from_slice(&claims_bytes).map_err(|_| TokenError::Malformed)?;

        if claims.caveats.expires_at <= now {
            return Err(TokenError::Expired(claims.caveats.expires_at));
        }

        Ok(claims.caveats)
    }

    /// Decode plus caveat match against the current request.
    pub fn verify_for_request(
        &self,
        token: &str,
        method: &str,
        path: &str,
        tenant_id: i64,
        now: DateTime<Utc>,
    ) -> Result<TokenCaveats, TokenError> {
        let caveats = self.decode(token, now)?;
        if !caveats.method.eq_ignore_ascii_case(method) {
            return Err(TokenError::CaveatMismatch("method"));
        }
        if caveats.path != path {
            return Err(TokenError::CaveatMismatch("path"));
        }
        if caveats.tenant_id != tenant_id {
            return Err(TokenError::CaveatMismatch("tenant"));
        }
        Ok(caveats)
    }
}

/// Check that `preimage_hex` is the SHA-256 preimage of `payment_hash_hex`.
///
/// Both values are lowercase hex; the preimage must decode to exactly 32
/// bytes. Returns `false` on any malformed input.
#[must_use]
pub fn verify_preimage(payment_hash_hex: &str, preimage_hex: &str) -> bool {
    let Ok(preimage) = hex::decode(preimage_hex.trim()) else {
        return false;
    };
    if preimage.len() != 32 {
        return false;
    }
    let computed = hex::encode(Sha256::digest(&preimage));
    computed.eq_ignore_ascii_case(payment_hash_hex.trim())
}

/// Parsed L402 challenge components from a `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub macaroon: String,
    pub invoice: String,
}

/// Why a `WWW-Authenticate` value failed to yield an L402 challenge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChallengeParseError {
    #[error("header carries no L402 scheme")]
    SchemeMissing,
    #[error("challenge parameter '{0}' is not a quoted string")]
    UnquotedValue(String),
    #[error("challenge is missing the '{0}' parameter")]
    MissingParam(&'static str),
}

impl Challenge {
    /// Render the `WWW-Authenticate` header value for a `402` response.
    #[must_use]
    pub fn to_www_authenticate(&self) -> String {
        format!(
            "L402 macaroon=\"{}\", invoice=\"{}\"",
            self.macaroon, self.invoice
        )
    }

    /// Parse an L402 challenge out of a `WWW-Authenticate` value.
    ///
    /// Other schemes in the same header are skipped, as are parameters the
    /// challenge does not use. `macaroon` and `invoice` must both be
    /// present, quoted, and non-empty.
    pub fn parse(header: &str) -> Result<Self, ChallengeParseError> {
        let params = challenge_params(header).ok_or(ChallengeParseError::SchemeMissing)?;

        let mut macaroon = None;
        let mut invoice = None;
        for segment in params.split(',') {
            let Some((key, raw_value)) = segment.split_once('=') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let slot = match key.as_str() {
                "macaroon" => &mut macaroon,
                "invoice" => &mut invoice,
                _ => continue,
            };
            let value = unquote(raw_value.trim())
                .ok_or_else(|| ChallengeParseError::UnquotedValue(key.clone()))?;
            if !value.is_empty() {
                *slot = Some(value.to_string());
            }
        }

        Ok(Self {
            macaroon: macaroon.ok_or(ChallengeParseError::MissingParam("macaroon"))?,
            invoice: invoice.ok_or(ChallengeParseError::MissingParam("invoice"))?,
        })
    }
}

/// Everything after the (case-insensitive) `L402` scheme token.
fn challenge_params(header: &str) -> Option<&str> {
    let header = header.trim();
    let at = header.to_ascii_lowercase().find("l402")?;
    Some(&header[at + "l402".len()..])
}

fn unquote(raw: &str) -> Option<&str> {
    raw.strip_prefix('"')?.strip_suffix('"')
}

/// Credential presented on a retried request: `Authorization: L402 <token>:<preimage>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub preimage: String,
}

impl Credential {
    /// Parse an `Authorization` header value of the form `L402 token:preimage`.
    #[must_use]
    pub fn parse(header: Option<&str>) -> Option<Self> {
        let raw = header?.trim();
        let rest = raw
            .strip_prefix("L402 ")
            .or_else(|| raw.strip_prefix("l402 "))?
            .trim();
        let (token, preimage) = rest.split_once(':')?;
        let token = token.trim();
        let preimage = preimage.trim();
        if token.is_empty() || preimage.is_empty() {
            return None;
        }
        Some(Self {
            token: token.to_string(),
            preimage: preimage.to_string(),
        })
    }
}

/// Minimal BOLT11 amount parser used for price cross-checks.
#[derive(Debug, Clone, Copy)]
pub struct Bolt11;

impl Bolt11 {
    /// Parse the amount from a BOLT11 invoice and return millisatoshis.
    ///
    /// Returns `None` if the invoice is amountless, malformed, carries an
    /// unsupported multiplier, or overflows 64-bit arithmetic.
    #[must_use]
    pub fn amount_msats(invoice: &str) -> Option<u64> {
        let normalized = invoice.trim().to_ascii_lowercase();
        let hrp = normalized.strip_prefix("ln")?;

        // A currency code of at least two letters precedes the amount.
        let amount_at = hrp.find(|c: char| !c.is_ascii_lowercase())?;
        if amount_at < 2 {
            return None;
        }

        let (digits, tail) = split_leading_digits(&hrp[amount_at..]);
        if digits.is_empty() {
            return None;
        }
        let units: u64 = digits.parse().ok()?;

        let mut tail_chars = tail.chars();
        let (multiplier, rest) = match tail_chars.next() {
            Some(c) if matches!(c, 'm' | 'u' | 'n' | 'p') => (Some(c), tail_chars.as_str()),
            _ => (None, tail),
        };

        // The bech32 separator must follow the amount directly.
        if !rest.starts_with('1') {
            return None;
        }
        scale_to_msats(units, multiplier)
    }

    /// Amount in whole satoshis, dropping sub-sat precision.
    #[must_use]
    pub fn amount_sats(invoice: &str) -> Option<u64> {
        Self::amount_msats(invoice).map(|msats| msats / 1000)
    }
}

fn split_leading_digits(raw: &str) -> (&str, &str) {
    let end = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    raw.split_at(end)
}

/// BOLT11 amount multipliers, scaled to millisatoshis. Picosats below
/// msat precision are rejected rather than rounded.
fn scale_to_msats(units: u64, multiplier: Option<char>) -> Option<u64> {
    match multiplier {
        None => units.checked_mul(100_000_000_000),
        Some('m') => units.checked_mul(100_000_000),
        Some('u') => units.checked_mul(100_000),
        Some('n') => units.checked_mul(100),
        Some('p') => {
            if units % 10 != 0 {
                return None;
            }
            Some(units / 10)
        }
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use sha2::{Digest, Sha256};

    use super::{
        Bolt11, Challenge, ChallengeParseError, Credential, TokenCaveats, TokenError, TokenMinter,
        TokenVerifier, verify_preimage,
    };

    const KEY: &[u8] = b"l402-test-signing-key";

    fn caveats(expires_in_seconds: i64) -> TokenCaveats {
        TokenCaveats {
            payment_hash: "aa".repeat(32),
            method: "POST".to_string(),
            path: "/api/v1/content-items".to_string(),
            tenant_id: 7,
            amount_sats: 500,
            expires_at: Utc::now() + Duration::seconds(expires_in_seconds),
        }
    }

    #[test]
    fn mint_and_verify_round_trip() {
        let minter = TokenMinter::new(KEY);
        let verifier = TokenVerifier::new(KEY);
        let token = minter
            .mint(caveats(60), "tok_1".to_string())
            .expect("mint should succeed");

        let decoded = verifier
            .verify_for_request(&token, "POST", "/api/v1/content-items", 7, Utc::now())
            .expect("verify should succeed");
        assert_eq!(decoded.amount_sats, 500);
        assert_eq!(decoded.payment_hash, "aa".repeat(32));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let minter = TokenMinter::new(KEY);
        let verifier = TokenVerifier::new(b"another-key");
        let token = minter
            .mint(caveats(60), "tok_2".to_string())
            .expect("mint should succeed");

        assert_eq!(
            verifier.decode(&token, Utc::now()),
            Err(TokenError::Signature)
        );
    }

    #[test]
    fn verify_rejects_expired_token() {
        let minter = TokenMinter::new(KEY);
        let verifier = TokenVerifier::new(KEY);
        let token = minter
            .mint(caveats(-5), "tok_3".to_string())
            .expect("mint should succeed");

        assert!(matches!(
            verifier.decode(&token, Utc::now()),
            Err(TokenError::Expired(_))
        ));
    }

    #[test]
    fn verify_rejects_caveat_mismatch() {
        let minter = TokenMinter::new(KEY);
        let verifier = TokenVerifier::new(KEY);
        let token = minter
            .mint(caveats(60), "tok_4".to_string())
            .expect("mint should succeed");

        let wrong_path = verifier.verify_for_request(&token, "POST", "/api/v1/other", 7, Utc::now());
        assert_eq!(wrong_path, Err(TokenError::CaveatMismatch("path")));

        let wrong_tenant =
            verifier.verify_for_request(&token, "POST", "/api/v1/content-items", 8, Utc::now());
        assert_eq!(wrong_tenant, Err(TokenError::CaveatMismatch("tenant")));
    }

    #[test]
    fn verify_rejects_tampered_claims() {
        let minter = TokenMinter::new(KEY);
        let verifier = TokenVerifier::new(KEY);
        let token = minter
            .mint(caveats(60), "tok_5".to_string())
            .expect("mint should succeed");

        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = "eyJmb3JnZWQiOnRydWV9";
        parts[1] = forged;
        let tampered = parts.join(".");

        assert_eq!(
            verifier.decode(&tampered, Utc::now()),
            Err(TokenError::Signature)
        );
    }

    #[test]
    fn preimage_proof_round_trip() {
        let preimage = [7u8; 32];
        let payment_hash = hex::encode(Sha256::digest(preimage));

        assert!(verify_preimage(&payment_hash, &hex::encode(preimage)));
        assert!(!verify_preimage(&payment_hash, &hex::encode([8u8; 32])));
        assert!(!verify_preimage(&payment_hash, "not-hex"));
        assert!(!verify_preimage(&payment_hash, &hex::encode([7u8; 16])));
    }

    #[test]
    fn challenge_header_round_trip() {
        let challenge = Challenge {
            macaroon: "mac".to_string(),
            invoice: "lnbc5u1rest".to_string(),
        };
        let header = challenge.to_www_authenticate();
        assert_eq!(header, "L402 macaroon=\"mac\", invoice=\"lnbc5u1rest\"");
        assert_eq!(Challenge::parse(&header), Ok(challenge));
    }

    #[test]
    fn challenge_parse_skips_other_schemes_and_unknown_params() {
        let parsed =
            Challenge::parse("Bearer realm=\"x\", L402 scope=\"r\", macaroon=\"m\", invoice=\"i\"");
        assert_eq!(
            parsed,
            Ok(Challenge {
                macaroon: "m".to_string(),
                invoice: "i".to_string(),
            })
        );
    }

    #[test]
    fn challenge_parse_reports_what_is_wrong() {
        assert_eq!(Challenge::parse(""), Err(ChallengeParseError::SchemeMissing));
        assert_eq!(
            Challenge::parse("Bearer realm=\"x\""),
            Err(ChallengeParseError::SchemeMissing)
        );
        assert_eq!(
            Challenge::parse("L402 macaroon=\"m\""),
            Err(ChallengeParseError::MissingParam("invoice"))
        );
        // An empty value counts as missing, not present.
        assert_eq!(
            Challenge::parse("L402 macaroon=\"\", invoice=\"i\""),
            Err(ChallengeParseError::MissingParam("macaroon"))
        );
        assert_eq!(
            Challenge::parse("L402 macaroon=bare, invoice=\"i\""),
            Err(ChallengeParseError::UnquotedValue("macaroon".to_string()))
        );
    }

    #[test]
    fn credential_parse_splits_token_and_preimage() {
        let parsed = Credential::parse(Some("L402 v1.abc.def:00ff"));
        assert_eq!(
            parsed,
            Some(Credential {
                token: "v1.abc.def".to_string(),
                preimage: "00ff".to_string(),
            })
        );

        assert!(Credential::parse(Some("Bearer xyz")).is_none());
        assert!(Credential::parse(Some("L402 no-separator")).is_none());
        assert!(Credential::parse(Some("L402 :preimage-only")).is_none());
    }

    #[test]
    fn bolt11_amount_parses_common_multipliers() {
        assert_eq!(Bolt11::amount_msats("lnbc420n1test"), Some(42_000));
        assert_eq!(Bolt11::amount_msats("LNBC1m1TEST"), Some(100_000_000));
        assert_eq!(Bolt11::amount_msats("lnbc2500u1test"), Some(2500 * 100_000));
        assert_eq!(Bolt11::amount_msats("lnbc10p1test"), Some(1));
        assert_eq!(Bolt11::amount_sats("lnbc5u1test"), Some(500));
    }

    #[test]
    fn bolt11_amount_rejects_invalid_formats() {
        assert_eq!(Bolt11::amount_msats("not-an-invoice"), None);
        assert_eq!(Bolt11::amount_msats("lnbc1amountless"), None);
        assert_eq!(Bolt11::amount_msats("lnbc10x1test"), None);
        assert_eq!(Bolt11::amount_msats("lnbc1p1test"), None);
    }
}
