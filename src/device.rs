//! Remote block device identity
//!
//! A [`DeviceIdentity`] names one LUN behind one iSCSI target reachable
//! through one portal. Sessions with equal identities refer to the same
//! physical device and share one canonical mount.

use crate::error::{VolumeError, VolumeResult};
use std::fmt;

/// Default iSCSI portal port (RFC 3720 Section 13.1)
pub const DEFAULT_PORT: u16 = 3260;

const IQN_SEPARATOR: &str = "-iqn-";
const LUN_SEPARATOR: &str = "-lun-";

/// Portal + target name + logical unit number
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    portal: String,
    iqn: String,
    lun: u32,
}

impl DeviceIdentity {
    /// Create a validated identity.
    ///
    /// A portal given without a port gets [`DEFAULT_PORT`]. The target name
    /// must use one of the iSCSI name formats (`iqn.`, `eui.`, `naa.`).
    pub fn new(portal: &str, iqn: &str, lun: u32) -> VolumeResult<Self> {
        let portal = normalize_portal(portal)?;

        if !is_valid_target_name(iqn) {
            return Err(VolumeError::InvalidArgument(format!(
                "target name must be in IQN format (e.g., iqn.2015-01.com.example:disk1), got {:?}",
                iqn
            )));
        }

        Ok(DeviceIdentity {
            portal,
            iqn: iqn.to_string(),
            lun,
        })
    }

    /// Portal address including port
    pub fn portal(&self) -> &str {
        &self.portal
    }

    /// Target name
    pub fn iqn(&self) -> &str {
        &self.iqn
    }

    /// Logical unit number
    pub fn lun(&self) -> u32 {
        self.lun
    }

    /// File name of the canonical shared mount: `<portal>-iqn-<iqn>-lun-<lun>`
    pub fn canonical_name(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.portal, IQN_SEPARATOR, self.iqn, LUN_SEPARATOR, self.lun
        )
    }

    /// Parse a name produced by [`canonical_name`](Self::canonical_name).
    pub fn from_canonical_name(name: &str) -> VolumeResult<Self> {
        let invalid = || {
            VolumeError::InvalidArgument(format!("not a canonical device name: {:?}", name))
        };

        // The portal may itself contain the separator (`san-iqn-01`); the
        // real one is followed by a target name.
        let (portal, rest) = name
            .match_indices(IQN_SEPARATOR)
            .map(|(idx, sep)| (&name[..idx], &name[idx + sep.len()..]))
            .find(|(_, rest)| has_target_name_prefix(rest))
            .ok_or_else(invalid)?;
        let (iqn, lun) = rest.rsplit_once(LUN_SEPARATOR).ok_or_else(invalid)?;
        let lun = lun.parse::<u32>().map_err(|_| invalid())?;

        DeviceIdentity::new(portal, iqn, lun)
    }

    /// Udev by-path link name: `ip-<portal>-iscsi-<iqn>-lun-<lun>`
    pub fn by_path_name(&self) -> String {
        format!("{}{}", self.by_path_prefix(), self.lun)
    }

    /// By-path prefix shared by every LUN behind the same portal and target
    pub fn by_path_prefix(&self) -> String {
        format!("ip-{}-iscsi-{}{}", self.portal, self.iqn, LUN_SEPARATOR)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} lun {} via {}", self.iqn, self.lun, self.portal)
    }
}

fn normalize_portal(portal: &str) -> VolumeResult<String> {
    let portal = portal.trim();
    if portal.is_empty() {
        return Err(VolumeError::InvalidArgument(
            "portal address must not be empty".to_string(),
        ));
    }
    if portal.contains(char::is_whitespace) || portal.contains('/') {
        return Err(VolumeError::InvalidArgument(format!(
            "invalid portal address {:?}",
            portal
        )));
    }

    // Bracketed IPv6 carries its port after the closing bracket
    let has_port = match portal.rfind(']') {
        Some(idx) => portal[idx..].contains(':'),
        None => portal.matches(':').count() == 1,
    };

    if has_port {
        Ok(portal.to_string())
    } else {
        Ok(format!("{}:{}", portal, DEFAULT_PORT))
    }
}

fn has_target_name_prefix(name: &str) -> bool {
    ["iqn.", "eui.", "naa."]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

fn is_valid_target_name(name: &str) -> bool {
    has_target_name_prefix(name) && name.len() > 4 && !name.contains(char::is_whitespace) && !name.contains('/')
}
