// src/core/nqn.rs

//! NVMe Qualified Name validation and address helpers.

use crate::core::errors::GwError;

/// The reserved NQN of the discovery service.
pub const DISCOVERY_NQN: &str = "nqn.2014-08.org.nvmexpress.discovery";

const NQN_MIN_LENGTH: usize = 11;
const NQN_MAX_LENGTH: usize = 223;
const NQN_PREFIX: &str = "nqn.";
const NQN_UUID_PREFIX: &str = "nqn.2014-08.org.nvmexpress:uuid:";
const UUID_STRING_LENGTH: usize = 36;
const DOMAIN_LABEL_MAX_LEN: usize = 63;

pub fn is_discovery_nqn(nqn: &str) -> bool {
    nqn == DISCOVERY_NQN
}

/// We need to enclose IPv6 addresses in brackets before concatenating a colon
/// and port number to it.
pub fn escape_address_if_ipv6(addr: &str) -> String {
    if addr.contains(':') && !addr.trim_start().starts_with('[') {
        format!("[{addr}]")
    } else {
        addr.to_string()
    }
}

fn is_valid_rev_domain(rev_domain: &str) -> Result<(), GwError> {
    for lbl in rev_domain.split('.') {
        if lbl.is_empty() {
            return Err(GwError::InvalidArgument(
                "empty domain label doesn't start with a letter".to_string(),
            ));
        }
        if lbl.len() > DOMAIN_LABEL_MAX_LEN {
            return Err(GwError::InvalidArgument(format!(
                "domain label {lbl} is too long"
            )));
        }
        if !lbl.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
            return Err(GwError::InvalidArgument(format!(
                "domain label {lbl} doesn't start with a letter"
            )));
        }
        if lbl.ends_with('-') {
            return Err(GwError::InvalidArgument(format!(
                "domain label {lbl} doesn't end with an alphanumeric character"
            )));
        }
        if !lbl.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(GwError::InvalidArgument(format!(
                "domain label {lbl} contains a character which is not [a-z,A-Z,0-9,'-','.']"
            )));
        }
    }
    Ok(())
}

/// Checks the textual shape of a UUID (8-4-4-4-12 hex groups).
pub fn is_valid_uuid(uuid_val: &str) -> bool {
    if uuid_val.len() != UUID_STRING_LENGTH {
        return false;
    }
    let parts: Vec<&str> = uuid_val.split('-').collect();
    if parts.len() != 5 {
        return false;
    }
    let expected = [8usize, 4, 4, 4, 12];
    for (part, len) in parts.iter().zip(expected.iter()) {
        if part.len() != *len {
            return false;
        }
        if u64::from_str_radix(part, 16).is_err() {
            return false;
        }
    }
    true
}

/// Validates an NQN, either `nqn.YYYY-MM.<reverse-domain>:<user>` or the
/// `nqn.2014-08.org.nvmexpress:uuid:<UUID>` form. The discovery NQN passes
/// validation; callers that must reject it check separately.
pub fn is_valid_nqn(nqn: &str) -> Result<(), GwError> {
    if nqn.len() < NQN_MIN_LENGTH {
        return Err(GwError::InvalidArgument(format!(
            "NQN \"{nqn}\" is too short, minimal length is {NQN_MIN_LENGTH}"
        )));
    }
    if nqn.len() > NQN_MAX_LENGTH {
        return Err(GwError::InvalidArgument(format!(
            "NQN \"{nqn}\" is too long, maximal length is {NQN_MAX_LENGTH}"
        )));
    }
    if is_discovery_nqn(nqn) {
        // Technically valid, most callers will reject it later for being a
        // discovery NQN.
        return Ok(());
    }

    if let Some(uuid_part) = nqn.strip_prefix(NQN_UUID_PREFIX) {
        if uuid_part.len() != UUID_STRING_LENGTH || !is_valid_uuid(uuid_part) {
            return Err(GwError::InvalidArgument(format!(
                "Invalid NQN \"{nqn}\": UUID is not formatted correctly"
            )));
        }
        return Ok(());
    }

    let Some(no_prefix) = nqn.strip_prefix(NQN_PREFIX) else {
        return Err(GwError::InvalidArgument(format!(
            "Invalid NQN \"{nqn}\", doesn't start with \"{NQN_PREFIX}\""
        )));
    };

    let split_pos = no_prefix.len().min(8);
    if !no_prefix.is_char_boundary(split_pos) {
        return Err(GwError::InvalidArgument(format!(
            "Invalid NQN \"{nqn}\": invalid date code"
        )));
    }
    let (date_part, rest) = no_prefix.split_at(split_pos);
    let Some(date_part) = date_part.strip_suffix('.') else {
        return Err(GwError::InvalidArgument(format!(
            "Invalid NQN \"{nqn}\": invalid date code"
        )));
    };
    let mut date_it = date_part.split('-');
    let (year, month) = match (date_it.next(), date_it.next(), date_it.next()) {
        (Some(y), Some(m), None) if y.len() == 4 && m.len() == 2 => (y, m),
        _ => {
            return Err(GwError::InvalidArgument(format!(
                "Invalid NQN \"{nqn}\": invalid date code"
            )))
        }
    };
    let year: u32 = year.parse().map_err(|_| {
        GwError::InvalidArgument(format!("Invalid NQN \"{nqn}\": invalid date code"))
    })?;
    let month: u32 = month.parse().map_err(|_| {
        GwError::InvalidArgument(format!("Invalid NQN \"{nqn}\": invalid date code"))
    })?;
    if year < 1900 || month == 0 || month > 12 {
        return Err(GwError::InvalidArgument(format!(
            "Invalid NQN \"{nqn}\": invalid date code"
        )));
    }

    let Some((rev_domain, user_part)) = rest.split_once(':') else {
        return Err(GwError::InvalidArgument(format!(
            "Invalid NQN \"{nqn}\": must contain a user specified name starting with a \":\""
        )));
    };
    if user_part.is_empty() {
        return Err(GwError::InvalidArgument(format!(
            "Invalid NQN \"{nqn}\": must contain a user specified name starting with a \":\""
        )));
    }

    is_valid_rev_domain(rev_domain).map_err(|e| {
        GwError::InvalidArgument(format!(
            "Invalid NQN \"{nqn}\": reverse domain is not formatted correctly: {e}"
        ))
    })
}

/// Host NQNs additionally allow the `*` wildcard meaning "any host".
pub fn is_valid_host_nqn(nqn: &str) -> Result<(), GwError> {
    if nqn == "*" {
        return Ok(());
    }
    is_valid_nqn(nqn)
}
