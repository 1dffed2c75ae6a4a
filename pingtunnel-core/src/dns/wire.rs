//! Minimal RFC 1035 message parsing: just enough to derive a cache key
//! from a query and the minimum TTL from a response. Not a general-purpose
//! DNS library — resource record RDATA is never interpreted, only
//! skipped.

const HEADER_LEN: usize = 12;
const MAX_POINTER_JUMPS: usize = 16;

/// Extracted cache-key material from a query packet: (lowercased QNAME,
/// QTYPE, QCLASS).
pub fn question(query: &[u8]) -> Option<(String, u16, u16)> {
    if query.len() < HEADER_LEN {
        return None;
    }
    let (name, offset) = read_name(query, HEADER_LEN)?;
    if query.len() < offset + 4 {
        return None;
    }
    let qtype = u16::from_be_bytes([query[offset], query[offset + 1]]);
    let qclass = u16::from_be_bytes([query[offset + 2], query[offset + 3]]);
    Some((name.to_lowercase(), qtype, qclass))
}

/// Overwrites bytes 0-1 (the transaction id) of a cached response with
/// the id from the current query, per the cache-hit replay rule.
pub fn with_transaction_id(cached: &[u8], query: &[u8]) -> Vec<u8> {
    let mut out = cached.to_vec();
    if out.len() >= 2 && query.len() >= 2 {
        out[0] = query[0];
        out[1] = query[1];
    }
    out
}

/// Minimum of all non-zero TTLs across the Answer, Authority, and
/// Additional sections, or `None` if no record carries one / the packet
/// doesn't parse. Callers clamp and apply the 300s default.
pub fn min_ttl(response: &[u8]) -> Option<u32> {
    if response.len() < HEADER_LEN {
        return None;
    }
    let qdcount = u16::from_be_bytes([response[4], response[5]]) as usize;
    let ancount = u16::from_be_bytes([response[6], response[7]]) as usize;
    let nscount = u16::from_be_bytes([response[8], response[9]]) as usize;
    let arcount = u16::from_be_bytes([response[10], response[11]]) as usize;

    let mut offset = HEADER_LEN;
    for _ in 0..qdcount {
        let (_, new_offset) = read_name(response, offset)?;
        offset = new_offset + 4; // QTYPE + QCLASS
    }

    let mut min: Option<u32> = None;
    for _ in 0..(ancount + nscount + arcount) {
        let (_, new_offset) = read_name(response, offset)?;
        // TYPE(2) CLASS(2) TTL(4) RDLENGTH(2) RDATA(RDLENGTH)
        if response.len() < new_offset + 10 {
            return min;
        }
        let ttl = u32::from_be_bytes([
            response[new_offset + 4],
            response[new_offset + 5],
            response[new_offset + 6],
            response[new_offset + 7],
        ]);
        let rdlength = u16::from_be_bytes([response[new_offset + 8], response[new_offset + 9]]) as usize;
        offset = new_offset + 10 + rdlength;
        if ttl != 0 {
            min = Some(min.map_or(ttl, |m| m.min(ttl)));
        }
        if offset > response.len() {
            return min;
        }
    }
    min
}

/// Reads a (possibly compressed) domain name starting at `offset`,
/// returning the name and the offset immediately after it in the
/// *original* stream (a pointer jump does not advance the returned
/// offset past the 2-byte pointer itself).
fn read_name(buf: &[u8], start: usize) -> Option<(String, usize)> {
    let mut labels = Vec::new();
    let mut offset = start;
    let mut end_offset = None;
    let mut jumps = 0;

    loop {
        let len = *buf.get(offset)?;
        if len == 0 {
            if end_offset.is_none() {
                end_offset = Some(offset + 1);
            }
            break;
        }
        if len & 0xC0 == 0xC0 {
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return None;
            }
            let lo = *buf.get(offset + 1)?;
            if end_offset.is_none() {
                end_offset = Some(offset + 2);
            }
            offset = (((len & 0x3F) as usize) << 8) | lo as usize;
            continue;
        }
        let len = len as usize;
        let label = buf.get(offset + 1..offset + 1 + len)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        offset += 1 + len;
    }

    Some((labels.join("."), end_offset.unwrap_or(offset)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_query(id: u16, name_labels: &[&str], qtype: u16, qclass: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(&[0x01, 0x00]); // flags: recursion desired
        buf.extend_from_slice(&1u16.to_be_bytes()); // qdcount
        buf.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // an/ns/ar count
        for label in name_labels {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
        buf.extend_from_slice(&qtype.to_be_bytes());
        buf.extend_from_slice(&qclass.to_be_bytes());
        buf
    }

    #[test]
    fn parses_qname_qtype_qclass_from_simple_query() {
        let query = build_query(0x1234, &["example", "com"], 1, 1);
        let (name, qtype, qclass) = question(&query).unwrap();
        assert_eq!(name, "example.com");
        assert_eq!(qtype, 1);
        assert_eq!(qclass, 1);
    }

    #[test]
    fn lowercases_the_qname() {
        let query = build_query(1, &["Example", "COM"], 1, 1);
        let (name, _, _) = question(&query).unwrap();
        assert_eq!(name, "example.com");
    }

    #[test]
    fn rejects_truncated_query() {
        assert!(question(&[0u8; 5]).is_none());
    }

    #[test]
    fn with_transaction_id_overwrites_only_first_two_bytes() {
        let cached = vec![0xAA, 0xBB, 1, 2, 3];
        let query = vec![0x11, 0x22, 9, 9];
        let result = with_transaction_id(&cached, &query);
        assert_eq!(result, vec![0x11, 0x22, 1, 2, 3]);
    }

    fn build_response_with_ttls(ttls: &[u32]) -> Vec<u8> {
        let mut buf = build_query(1, &["example", "com"], 1, 1);
        // Overwrite ancount.
        let ancount = (ttls.len() as u16).to_be_bytes();
        buf[6] = ancount[0];
        buf[7] = ancount[1];
        for ttl in ttls {
            // Name: pointer to offset 12 (the question's name).
            buf.extend_from_slice(&[0xC0, 0x0C]);
            buf.extend_from_slice(&1u16.to_be_bytes()); // TYPE A
            buf.extend_from_slice(&1u16.to_be_bytes()); // CLASS IN
            buf.extend_from_slice(&ttl.to_be_bytes());
            buf.extend_from_slice(&4u16.to_be_bytes()); // RDLENGTH
            buf.extend_from_slice(&[127, 0, 0, 1]); // RDATA
        }
        buf
    }

    #[test]
    fn min_ttl_takes_the_minimum_non_zero_ttl() {
        let response = build_response_with_ttls(&[300, 60, 120]);
        assert_eq!(min_ttl(&response), Some(60));
    }

    #[test]
    fn min_ttl_ignores_zero_ttls() {
        let response = build_response_with_ttls(&[0, 0, 45]);
        assert_eq!(min_ttl(&response), Some(45));
    }

    #[test]
    fn min_ttl_is_none_when_no_answers() {
        let response = build_response_with_ttls(&[]);
        assert_eq!(min_ttl(&response), None);
    }
}
