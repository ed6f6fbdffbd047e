use std::{
    fs,
    io::{BufReader, Cursor},
    path::Path,
};

use der::{time::PrimitiveDateTime, Decode as _};
use eyre::{eyre, WrapErr as _};
use time::{Duration, OffsetDateTime};
use zeroize::Zeroizing;

/// Renewal threshold used when none (or garbage) is configured.
pub const DEFAULT_RENEW_DAYS: i64 = 30;

/// Encapsulated certificate and private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    private_key_pem: Zeroizing<String>,
    certificate: String,
}

impl Certificate {
    pub fn new(private_key_pem: Zeroizing<String>, certificate: String) -> Self {
        Certificate {
            private_key_pem,
            certificate,
        }
    }

    /// Wraps PEM material after checking that both halves decode.
    pub fn parse(private_key_pem: Zeroizing<String>, certificate: String) -> eyre::Result<Self> {
        let cert = Certificate {
            private_key_pem,
            certificate,
        };

        // validate certificate
        cert.not_after()?;

        // validate private key
        let mut rdr = BufReader::new(Cursor::new(cert.private_key()));
        rustls_pemfile::private_key(&mut rdr)
            .context("read private key")?
            .ok_or_else(|| eyre!("no private key in PEM"))?;

        Ok(cert)
    }

    /// The private key in PEM format.
    pub fn private_key(&self) -> &str {
        &self.private_key_pem
    }

    /// The issued certificate file in PEM format.
    pub fn certificate(&self) -> &str {
        &self.certificate
    }

    /// The issued certificate chain in DER format.
    pub fn certificate_chain(&self) -> eyre::Result<Vec<Vec<u8>>> {
        let mut rdr = BufReader::new(Cursor::new(self.certificate()));

        rustls_pemfile::certs(&mut rdr)
            .map(|res| res.map(|cert| cert.to_vec()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Expiry of the end-entity certificate.
    pub fn not_after(&self) -> eyre::Result<OffsetDateTime> {
        let cert_chain = self.certificate_chain()?;
        let cert_ee = cert_chain
            .first() // EE cert is first
            .ok_or_else(|| eyre!("no certificates in chain"))?;

        let cert = x509_cert::Certificate::from_der(cert_ee).context("decode certificate")?;

        let not_after = cert.tbs_certificate.validity.not_after.to_date_time();

        // X.509 validity times are UTC by definition
        let not_after = PrimitiveDateTime::try_from(not_after)
            .context("certificate expiry out of range")?
            .assume_utc();

        Ok(not_after)
    }

    /// Count of whole valid days left at `now`.
    ///
    /// Negative for an expired certificate.
    pub fn valid_days_left(&self, now: OffsetDateTime) -> eyre::Result<i64> {
        Ok((self.not_after()? - now).whole_days())
    }

    /// Returns true once `now` is within `renew_days` of expiry.
    ///
    /// A window reaching past the representable date range is always due.
    pub fn renewal_due(&self, renew_days: i64, now: OffsetDateTime) -> eyre::Result<bool> {
        let not_after = self.not_after()?;

        let renew_at = renew_days
            .checked_mul(Duration::DAY.whole_seconds())
            .map(Duration::seconds)
            .and_then(|window| not_after.checked_sub(window));

        Ok(renew_at.map_or(true, |renew_at| now >= renew_at))
    }
}

/// Decides whether the certificate stored at `cert_path` must be reissued.
///
/// A missing, unreadable or undecodable file is due: that is the normal state before the first
/// issuance, not an error.
pub fn should_renew(cert_path: &Path, renew_days: i64) -> bool {
    should_renew_at(cert_path, renew_days, OffsetDateTime::now_utc())
}

/// [`should_renew`] evaluated at `now`.
pub fn should_renew_at(cert_path: &Path, renew_days: i64, now: OffsetDateTime) -> bool {
    let pem = match fs::read_to_string(cert_path) {
        Ok(pem) => pem,
        Err(err) => {
            log::debug!("no usable certificate at {}: {err}", cert_path.display());
            return true;
        }
    };

    // the key is irrelevant for the expiry check
    let cert = Certificate::new(Zeroizing::default(), pem);

    cert.renewal_due(renew_days, now).unwrap_or_else(|err| {
        log::debug!("undecodable certificate at {}: {err:#}", cert_path.display());
        true
    })
}
