//! Minimal DNS wire format (RFC 1035) for `A` lookups.

use anyhow::{ensure, Result};
use std::net::Ipv4Addr;

/// Record type `A`.
pub const QTYPE_A: u16 = 1;

/// Class `IN`.
const QCLASS_IN: u16 = 1;

/// Flags for a standard query with recursion desired.
const FLAGS_RD: u16 = 0x0100;

/// Build a single-question query for `host`.
pub fn build_query(host: &str, qtype: u16, id: u16) -> Result<Vec<u8>> {
    let qname = host.trim().trim_end_matches('.');
    ensure!(!qname.is_empty(), "DNS host is empty");

    let mut out = Vec::with_capacity(512);
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&FLAGS_RD.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    out.extend_from_slice(&[0u8; 6]); // AN/NS/AR counts

    for label in qname.split('.') {
        ensure!(!label.is_empty(), "DNS host contains empty label: {}", host);
        ensure!(label.len() <= 63, "DNS label too long (max 63): {}", label);
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out.extend_from_slice(&qtype.to_be_bytes());
    out.extend_from_slice(&QCLASS_IN.to_be_bytes());
    Ok(out)
}

/// Transaction id of a message, if it is long enough to carry a header.
pub fn response_id(packet: &[u8]) -> Option<u16> {
    if packet.len() < 12 {
        return None;
    }
    Some(u16::from_be_bytes([packet[0], packet[1]]))
}

/// Extract the IPv4 addresses from the answer section of a response.
///
/// NXDOMAIN yields an empty list; other failures are errors.
pub fn parse_a_records(response: &[u8], id: u16) -> Result<Vec<Ipv4Addr>> {
    ensure!(response.len() >= 12, "DNS response too short");
    let got = u16::from_be_bytes([response[0], response[1]]);
    ensure!(got == id, "DNS response id mismatch: expected {}, got {}", id, got);

    let flags = u16::from_be_bytes([response[2], response[3]]);
    ensure!(flags & 0x8000 != 0, "DNS response missing QR flag");
    ensure!(flags & 0x0200 == 0, "DNS response was truncated");
    let rcode = flags & 0x000F;
    if rcode == 3 {
        return Ok(Vec::new());
    }
    ensure!(rcode == 0, "DNS query failed with rcode {}", rcode);

    let qdcount = u16::from_be_bytes([response[4], response[5]]) as usize;
    let ancount = u16::from_be_bytes([response[6], response[7]]) as usize;

    let mut offset = 12;
    for _ in 0..qdcount {
        offset = skip_name(response, offset)?;
        ensure!(offset + 4 <= response.len(), "DNS question truncated");
        offset += 4;
    }

    let mut ips = Vec::new();
    for _ in 0..ancount {
        offset = skip_name(response, offset)?;
        ensure!(offset + 10 <= response.len(), "DNS answer header truncated");
        let rr_type = u16::from_be_bytes([response[offset], response[offset + 1]]);
        let rr_class = u16::from_be_bytes([response[offset + 2], response[offset + 3]]);
        let rdlength = u16::from_be_bytes([response[offset + 8], response[offset + 9]]) as usize;
        offset += 10;
        ensure!(offset + rdlength <= response.len(), "DNS answer rdata truncated");

        // CNAMEs and friends are skipped; the server already chased them
        if rr_type == QTYPE_A && rr_class == QCLASS_IN && rdlength == 4 {
            let ip = Ipv4Addr::new(
                response[offset],
                response[offset + 1],
                response[offset + 2],
                response[offset + 3],
            );
            if !ips.contains(&ip) {
                ips.push(ip);
            }
        }
        offset += rdlength;
    }

    Ok(ips)
}

/// Step over a (possibly compressed) name starting at `offset`.
fn skip_name(packet: &[u8], mut offset: usize) -> Result<usize> {
    loop {
        ensure!(offset < packet.len(), "DNS name out of bounds");
        let len = packet[offset];
        if len == 0 {
            return Ok(offset + 1);
        }

        match len & 0xC0 {
            0xC0 => {
                ensure!(
                    offset + 1 < packet.len(),
                    "DNS name compression pointer truncated"
                );
                return Ok(offset + 2);
            }
            0 => {
                let label_len = len as usize;
                offset += 1;
                ensure!(
                    offset + label_len <= packet.len(),
                    "DNS name label truncated"
                );
                offset += label_len;
            }
            _ => anyhow::bail!("DNS name label has invalid high bits"),
        }
    }
}
