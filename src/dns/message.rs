//! Stub-resolver query construction and reply parsing, built on typed DNS
//! wire messages rather than hand-rolled byte manipulation.

use domain::base::iana::Rtype;
use domain::base::{Message, MessageBuilder, Name};
use domain::rdata::AllRecordData;
use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum DnsMessageError {
    #[error("domain name is not well-formed")]
    InvalidName,
    #[error("failed to build DNS query")]
    Build,
    #[error("failed to parse DNS message")]
    Parse,
}

/// Builds a stub-resolver query: recursion desired, authenticated-data
/// bit set, random 16-bit id, asking for the A or AAAA record of `domain`.
pub fn build_query(domain: &str, rtype: Rtype, id: u16) -> Result<Vec<u8>, DnsMessageError> {
    let name =
        Name::<Vec<u8>>::from_str(domain).map_err(|_| DnsMessageError::InvalidName)?;

    let mut builder = MessageBuilder::new_vec().question();
    builder.header_mut().set_id(id);
    builder.header_mut().set_rd(true);
    builder.header_mut().set_ad(true);
    builder
        .push((name, rtype))
        .map_err(|_| DnsMessageError::Build)?;

    Ok(builder.into_message().into_octets())
}

/// Parses the answer section of a reply, returning the A/AAAA addresses
/// it contains. Replies whose id doesn't match `expected_id`, or that
/// aren't actually responses, are treated as empty rather than erroring —
/// the caller drops them silently, per the resolver's parse-error policy.
pub fn parse_addresses(
    buf: &[u8],
    expected_id: u16,
    rtype: Rtype,
) -> Result<Vec<IpAddr>, DnsMessageError> {
    let message = Message::from_octets(buf).map_err(|_| DnsMessageError::Parse)?;

    if message.header().id() != expected_id || !message.header().qr() {
        return Ok(Vec::new());
    }

    let answer = message.answer().map_err(|_| DnsMessageError::Parse)?;

    let mut addrs = Vec::new();
    for record in answer {
        let record = record.map_err(|_| DnsMessageError::Parse)?;
        let Ok(record) = record.into_any_record::<AllRecordData<_, _>>() else {
            continue;
        };
        match record.data() {
            AllRecordData::A(a) if rtype == Rtype::A => addrs.push(IpAddr::V4(a.addr())),
            AllRecordData::Aaaa(aaaa) if rtype == Rtype::AAAA => {
                addrs.push(IpAddr::V6(aaaa.addr()))
            }
            _ => {}
        }
    }

    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_well_formed_query() {
        let bytes = build_query("example.com", Rtype::A, 0x1234).unwrap();
        let message = Message::from_octets(bytes.as_slice()).unwrap();
        assert_eq!(message.header().id(), 0x1234);
        assert!(message.header().rd());
        assert!(message.header().ad());
        assert!(!message.header().qr());
    }

    #[test]
    fn rejects_malformed_domain() {
        assert!(build_query("", Rtype::A, 1).is_err() || build_query("..", Rtype::A, 1).is_err());
    }
}
