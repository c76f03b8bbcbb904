//! NETWORK_INTERFACE_INFO decoding
//!
//! The server reports its interfaces as a chain of fixed-size entries:
//!
//! ```text
//! 0   Next        u32   offset of the next entry, 0 for the last
//! 4   IfIndex     u32
//! 8   Capability  u32   RSS = 0x1, RDMA = 0x2
//! 12  Reserved    u32
//! 16  LinkSpeed   u64   bits per second
//! 24  SockAddr    128   family u16 + family-specific buffer
//! ```
//!
//! One entry carries one address, so an interface with several addresses
//! appears several times. Entries are folded into one [`NicAdvertisement`]
//! per interface index.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use tracing::debug;

use super::{NicAdvertisement, NicCapabilities, NicIndex};
use crate::error::{Error, Result};

/// Size of one entry on the wire
pub const ENTRY_LEN: usize = 152;

const SOCKADDR_OFFSET: usize = 24;
const SOCKADDR_LEN: usize = 128;

const FAMILY_INET: u16 = 0x0002;
const FAMILY_INET6: u16 = 0x0017;

/// Decode a NETWORK_INTERFACE_INFO buffer into advertisements ordered by index
pub fn parse_network_interface_info(buf: &[u8]) -> Result<Vec<NicAdvertisement>> {
    let mut nics: BTreeMap<NicIndex, NicAdvertisement> = BTreeMap::new();
    let mut offset = 0usize;

    if buf.is_empty() {
        return Ok(Vec::new());
    }

    loop {
        let entry = buf.get(offset..offset + ENTRY_LEN).ok_or_else(|| {
            Error::malformed(format!(
                "entry at offset {} truncated ({} bytes available)",
                offset,
                buf.len().saturating_sub(offset)
            ))
        })?;

        let next = read_u32(entry, 0) as usize;
        let index = read_u32(entry, 4);
        let capabilities = NicCapabilities::from_bits(read_u32(entry, 8));
        let speed = read_u64(entry, 16);

        match decode_sockaddr(&entry[SOCKADDR_OFFSET..SOCKADDR_OFFSET + SOCKADDR_LEN]) {
            Some(addr) => {
                let nic = nics
                    .entry(index)
                    .or_insert_with(|| NicAdvertisement::new(index, speed, Vec::new()));
                nic.capabilities = nic.capabilities | capabilities;
                if !nic.addresses.contains(&addr) {
                    nic.addresses.push(addr);
                }
            }
            None => debug!("Skipping interface {} entry with unknown address family", index),
        }

        if next == 0 {
            break;
        }
        if next < ENTRY_LEN {
            return Err(Error::malformed(format!(
                "next offset {} overlaps entry at offset {}",
                next, offset
            )));
        }
        offset = offset
            .checked_add(next)
            .ok_or_else(|| Error::malformed("next offset overflows"))?;
    }

    Ok(nics.into_values().collect())
}

fn decode_sockaddr(storage: &[u8]) -> Option<SocketAddr> {
    let family = u16::from_le_bytes([storage[0], storage[1]]);
    let port = u16::from_be_bytes([storage[2], storage[3]]);

    match family {
        FAMILY_INET => {
            let octets: [u8; 4] = storage[4..8].try_into().ok()?;
            Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port)))
        }
        FAMILY_INET6 => {
            let flow_info = u32::from_be_bytes(storage[4..8].try_into().ok()?);
            let octets: [u8; 16] = storage[8..24].try_into().ok()?;
            let scope_id = read_u32(storage, 24);
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                flow_info,
                scope_id,
            )))
        }
        _ => None,
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}
