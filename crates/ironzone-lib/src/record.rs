use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::Context;

use crate::{ByteBuf, EncodeToBuf, FromBuf, RecordType};

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ResourceRecord<'a> {
    pub name: Cow<'a, str>,
    pub class: u16,
    pub ttl: u32,
    pub resource_data: ResourceData<'a>,
}

impl<'a> ResourceRecord<'a> {
    pub fn new<'s: 'a>(name: &'s str, resource_data: ResourceData<'a>, ttl: Option<u32>, class: Option<u16>) -> Self {
        ResourceRecord {
            name: name.into(),
            ttl: ttl.unwrap_or_default(),
            class: class.unwrap_or(1),
            resource_data,
        }
    }

    pub fn into_owned(self) -> ResourceRecord<'static> {
        ResourceRecord {
            name: self.name.into_owned().into(),
            class: self.class,
            ttl: self.ttl,
            resource_data: self.resource_data.into_owned(),
        }
    }
}

impl FromBuf for ResourceRecord<'_> {
    fn from_buf(buf: &mut ByteBuf<'_>) -> anyhow::Result<ResourceRecord<'static>> {
        let name = buf.read_qname().context("NAME is missing")?;
        let record_type: RecordType = buf.read_u16().context("TYPE is missing")?.into();
        let class = buf.read_u16().context("CLASS is missing")?;
        let ttl = buf.read_u32().context("TTL is missing")?;
        let resource_data = ResourceData::from_buf_with_type(buf, record_type).context("can't decode RDATA")?;
        Ok(ResourceRecord {
            name,
            ttl,
            resource_data,
            class,
        })
    }
}

impl EncodeToBuf for ResourceRecord<'_> {
    fn encode_to_buf_with_cache<'cache, 'r: 'cache>(
        &'r self,
        buf: &mut ByteBuf,
        mut label_cache: Option<&mut HashMap<&'cache str, usize>>,
    ) -> anyhow::Result<usize> {
        let start = buf.len();
        buf.write_qname(&self.name, label_cache.as_deref_mut())
            .context("writing NAME")?;
        buf.write_u16(self.resource_data.get_record_type().into());
        buf.write_u16(self.class);
        buf.write_u32(self.ttl);

        self.resource_data
            .encode_to_buf_with_cache(buf, label_cache)
            .context("writing RDATA")?;

        Ok(buf.len() - start)
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ResourceData<'a> {
    UNKNOWN {
        qtype: u16,
        rdata: Cow<'a, [u8]>,
    },
    A {
        address: Ipv4Addr,
    },
    NS {
        ns_domain_name: Cow<'a, str>,
    },
    CNAME {
        cname: Cow<'a, str>,
    },
    SOA {
        mname: Cow<'a, str>,
        rname: Cow<'a, str>,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    PTR {
        ptr_domain_name: Cow<'a, str>,
    },
    MX {
        preference: u16,
        exchange: Cow<'a, str>,
    },
    TXT {
        strings: Vec<Cow<'a, [u8]>>,
    },
    AAAA {
        address: Ipv6Addr,
    },
    TSIG {
        algorithm_name: Cow<'a, str>,
        time_signed: u64,
        fudge: u16,
        mac: Cow<'a, [u8]>,
        original_id: u16,
        error: u16,
        other_data: Cow<'a, [u8]>,
    },
}

impl<'a> ResourceData<'a> {
    pub fn from_buf_with_type(buf: &mut ByteBuf<'a>, record_type: RecordType) -> anyhow::Result<ResourceData<'static>> {
        let rd_length = buf.read_u16().context("RDLENGTH is missing")?;
        Ok(match record_type {
            RecordType::UNKNOWN(record_type) => {
                let data = buf
                    .read_bytes(rd_length as usize)
                    .context("UNKNOWN record: RDATA is missing")?;
                ResourceData::UNKNOWN {
                    qtype: record_type,
                    rdata: data.to_vec().into(),
                }
            }
            RecordType::A => {
                if rd_length != 4 {
                    anyhow::bail!("A record: unexpected RDLENGTH {}", rd_length);
                }
                let address_raw = buf.read_bytes(4).context("A record: ADDRESS is missing")?;
                let address = Ipv4Addr::from(TryInto::<[u8; 4]>::try_into(address_raw).unwrap());
                ResourceData::A { address }
            }
            RecordType::NS => {
                let ns_domain_name = buf.read_qname().context("NS record: NSDNAME is missing")?;
                ResourceData::NS { ns_domain_name }
            }
            RecordType::CNAME => {
                let cname = buf.read_qname().context("CNAME record: CNAME is missing")?;
                ResourceData::CNAME { cname }
            }
            RecordType::SOA => {
                let mname = buf.read_qname().context("SOA record: MNAME is missing")?;
                let rname = buf.read_qname().context("SOA record: RNAME is missing")?;
                let serial = buf.read_u32().context("SOA record: SERIAL is missing")?;
                let refresh = buf.read_u32().context("SOA record: REFRESH is missing")?;
                let retry = buf.read_u32().context("SOA record: RETRY is missing")?;
                let expire = buf.read_u32().context("SOA record: EXPIRE is missing")?;
                let minimum = buf.read_u32().context("SOA record: MINIMUM is missing")?;
                ResourceData::SOA {
                    mname,
                    rname,
                    serial,
                    refresh,
                    retry,
                    expire,
                    minimum,
                }
            }
            RecordType::PTR => {
                let ptr_domain_name = buf.read_qname().context("PTR record: PTRDNAME is missing")?;
                ResourceData::PTR { ptr_domain_name }
            }
            RecordType::MX => {
                let preference = buf.read_u16().context("MX record: PREFERENCE is missing")?;
                let exchange = buf.read_qname().context("MX record: EXCHANGE is missing")?;
                ResourceData::MX { preference, exchange }
            }
            RecordType::TXT => {
                let mut remaining = rd_length as usize;
                let mut strings = Vec::new();
                while remaining > 0 {
                    let len = buf.read_u8().context("TXT record: string length is missing")? as usize;
                    let data = buf
                        .read_bytes(len)
                        .with_context(|| format!("TXT record: string of length {} is missing", len))?;
                    strings.push(Cow::Owned(data.to_vec()));
                    remaining = remaining
                        .checked_sub(1 + len)
                        .context("TXT record: strings overrun RDLENGTH")?;
                }
                ResourceData::TXT { strings }
            }
            RecordType::AAAA => {
                if rd_length != 16 {
                    anyhow::bail!("AAAA record: unexpected RDLENGTH {}", rd_length);
                }
                let address_raw = buf.read_bytes(16).context("AAAA record: ADDRESS is missing")?;
                let address = Ipv6Addr::from(TryInto::<[u8; 16]>::try_into(address_raw).unwrap());
                ResourceData::AAAA { address }
            }
            RecordType::TSIG => {
                let algorithm_name = buf.read_qname().context("TSIG record: algorithm name is missing")?;
                let time_signed = buf.read_u48().context("TSIG record: time signed is missing")?;
                let fudge = buf.read_u16().context("TSIG record: fudge is missing")?;
                let mac_size = buf.read_u16().context("TSIG record: MAC size is missing")?;
                let mac = buf
                    .read_bytes(mac_size as usize)
                    .context("TSIG record: MAC is missing")?
                    .to_vec();
                let original_id = buf.read_u16().context("TSIG record: original ID is missing")?;
                let error = buf.read_u16().context("TSIG record: error is missing")?;
                let other_len = buf.read_u16().context("TSIG record: other length is missing")?;
                let other_data = buf
                    .read_bytes(other_len as usize)
                    .context("TSIG record: other data is missing")?
                    .to_vec();
                ResourceData::TSIG {
                    algorithm_name,
                    time_signed,
                    fudge,
                    mac: mac.into(),
                    original_id,
                    error,
                    other_data: other_data.into(),
                }
            }
            RecordType::IXFR | RecordType::AXFR | RecordType::ANY => {
                anyhow::bail!("{:?} is a query type and can't appear in RDATA", record_type)
            }
        })
    }

    pub fn get_record_type(&self) -> RecordType {
        match self {
            ResourceData::UNKNOWN { qtype, .. } => RecordType::UNKNOWN(*qtype),
            ResourceData::A { .. } => RecordType::A,
            ResourceData::NS { .. } => RecordType::NS,
            ResourceData::CNAME { .. } => RecordType::CNAME,
            ResourceData::SOA { .. } => RecordType::SOA,
            ResourceData::PTR { .. } => RecordType::PTR,
            ResourceData::MX { .. } => RecordType::MX,
            ResourceData::TXT { .. } => RecordType::TXT,
            ResourceData::AAAA { .. } => RecordType::AAAA,
            ResourceData::TSIG { .. } => RecordType::TSIG,
        }
    }

    pub fn into_owned(self) -> ResourceData<'static> {
        match self {
            ResourceData::UNKNOWN { qtype, rdata } => ResourceData::UNKNOWN {
                qtype,
                rdata: rdata.into_owned().into(),
            },
            ResourceData::A { address } => ResourceData::A { address },
            ResourceData::NS { ns_domain_name } => ResourceData::NS {
                ns_domain_name: ns_domain_name.into_owned().into(),
            },
            ResourceData::CNAME { cname } => ResourceData::CNAME {
                cname: cname.into_owned().into(),
            },
            ResourceData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => ResourceData::SOA {
                mname: mname.into_owned().into(),
                rname: rname.into_owned().into(),
                serial,
                refresh,
                retry,
                expire,
                minimum,
            },
            ResourceData::PTR { ptr_domain_name } => ResourceData::PTR {
                ptr_domain_name: ptr_domain_name.into_owned().into(),
            },
            ResourceData::MX { preference, exchange } => ResourceData::MX {
                preference,
                exchange: exchange.into_owned().into(),
            },
            ResourceData::TXT { strings } => ResourceData::TXT {
                strings: strings.into_iter().map(|s| s.into_owned().into()).collect(),
            },
            ResourceData::AAAA { address } => ResourceData::AAAA { address },
            ResourceData::TSIG {
                algorithm_name,
                time_signed,
                fudge,
                mac,
                original_id,
                error,
                other_data,
            } => ResourceData::TSIG {
                algorithm_name: algorithm_name.into_owned().into(),
                time_signed,
                fudge,
                mac: mac.into_owned().into(),
                original_id,
                error,
                other_data: other_data.into_owned().into(),
            },
        }
    }

    /// Renders RDATA the way it would appear in a zone file. Used for
    /// logging and for persisting transferred records.
    pub fn to_zone_text(&self) -> String {
        match self {
            ResourceData::UNKNOWN { rdata, .. } => hex_string(rdata),
            ResourceData::A { address } => address.to_string(),
            ResourceData::NS { ns_domain_name } => ns_domain_name.to_string(),
            ResourceData::CNAME { cname } => cname.to_string(),
            ResourceData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => format!("{} {} {} {} {} {} {}", mname, rname, serial, refresh, retry, expire, minimum),
            ResourceData::PTR { ptr_domain_name } => ptr_domain_name.to_string(),
            ResourceData::MX { preference, exchange } => format!("{} {}", preference, exchange),
            ResourceData::TXT { strings } => strings
                .iter()
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .collect::<Vec<_>>()
                .join(" "),
            ResourceData::AAAA { address } => address.to_string(),
            ResourceData::TSIG { mac, .. } => hex_string(mac),
        }
    }
}

fn hex_string(data: &[u8]) -> String {
    data.iter().fold(String::with_capacity(data.len() * 2), |mut out, byte| {
        let _ = write!(out, "{:02x}", byte);
        out
    })
}

impl EncodeToBuf for ResourceData<'_> {
    fn encode_to_buf_with_cache<'cache, 'r: 'cache>(
        &'r self,
        buf: &mut ByteBuf,
        mut label_cache: Option<&mut HashMap<&'cache str, usize>>,
    ) -> anyhow::Result<usize> {
        let start = buf.len();
        match self {
            ResourceData::UNKNOWN { rdata: data, .. } => {
                buf.write_u16(data.len() as u16);
                buf.write_bytes(data);
            }
            ResourceData::A { address } => {
                buf.write_u16(4);
                buf.write_bytes(&address.octets());
            }
            ResourceData::NS { ns_domain_name } => {
                let rdata_pos = buf.len();
                // We don't know how many bytes qname encoding will take in advance,
                // so we can just write a stub value and replace it later
                buf.write_u16(0);
                let qname_length = buf
                    .write_qname(ns_domain_name, label_cache)
                    .context("NS record: writing NSDNAME")?;
                // Set actual RDLENGTH
                buf.set_u16(rdata_pos, qname_length as u16)
                    .context("NS record: writing RDLENGTH")?;
            }
            ResourceData::CNAME { cname } => {
                let rdata_pos = buf.len();
                buf.write_u16(0);
                let qname_length = buf.write_qname(cname, label_cache).context("CNAME record: writing CNAME")?;
                buf.set_u16(rdata_pos, qname_length as u16)
                    .context("CNAME record: writing RDLENGTH")?;
            }
            ResourceData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                let rdata_pos = buf.len();
                buf.write_u16(0);
                let mut rd_length = buf
                    .write_qname(mname, label_cache.as_deref_mut())
                    .context("SOA record: writing MNAME")?;
                rd_length += buf.write_qname(rname, label_cache).context("SOA record: writing RNAME")?;
                buf.write_u32(*serial);
                buf.write_u32(*refresh);
                buf.write_u32(*retry);
                buf.write_u32(*expire);
                buf.write_u32(*minimum);
                rd_length += 20;
                buf.set_u16(rdata_pos, rd_length as u16)
                    .context("SOA record: writing RDLENGTH")?;
            }
            ResourceData::PTR { ptr_domain_name } => {
                let rdata_pos = buf.len();
                buf.write_u16(0);
                let qname_length = buf
                    .write_qname(ptr_domain_name, label_cache)
                    .context("PTR record: writing PTRDNAME")?;
                buf.set_u16(rdata_pos, qname_length as u16)
                    .context("PTR record: writing RDLENGTH")?;
            }
            ResourceData::MX { preference, exchange } => {
                let rdata_pos = buf.len();
                buf.write_u16(0);
                buf.write_u16(*preference);
                let qname_length = buf
                    .write_qname(exchange, label_cache)
                    .context("MX record: writing EXCHANGE")?;
                buf.set_u16(rdata_pos, 2 + qname_length as u16)
                    .context("MX record: writing RDLENGTH")?;
            }
            ResourceData::TXT { strings } => {
                let rd_length: usize = strings.iter().map(|s| 1 + s.len()).sum();
                buf.write_u16(rd_length as u16);
                for string in strings {
                    if string.len() > 255 {
                        anyhow::bail!("TXT record: string is too long ({})", string.len());
                    }
                    buf.write_u8(string.len() as u8);
                    buf.write_bytes(string);
                }
            }
            ResourceData::AAAA { address } => {
                buf.write_u16(16);
                buf.write_bytes(&address.octets());
            }
            ResourceData::TSIG {
                algorithm_name,
                time_signed,
                fudge,
                mac,
                original_id,
                error,
                other_data,
            } => {
                let rdata_pos = buf.len();
                buf.write_u16(0);
                // TSIG names are never compressed (RFC 2845 §2.3)
                let mut rd_length = buf
                    .write_qname(algorithm_name, None)
                    .context("TSIG record: writing algorithm name")?;
                buf.write_u48(*time_signed);
                buf.write_u16(*fudge);
                buf.write_u16(mac.len() as u16);
                buf.write_bytes(mac);
                buf.write_u16(*original_id);
                buf.write_u16(*error);
                buf.write_u16(other_data.len() as u16);
                buf.write_bytes(other_data);
                rd_length += 6 + 2 + 2 + mac.len() + 2 + 2 + 2 + other_data.len();
                buf.set_u16(rdata_pos, rd_length as u16)
                    .context("TSIG record: writing RDLENGTH")?;
            }
        };

        Ok(buf.len() - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{arb_resource_data, arb_resource_record};
    use proptest::prelude::*;

    #[test]
    fn soa_zone_text() {
        let soa = ResourceData::SOA {
            mname: "ns1.example.com".into(),
            rname: "hostmaster.example.com".into(),
            serial: 2024010101,
            refresh: 7200,
            retry: 1800,
            expire: 1209600,
            minimum: 300,
        };
        assert_eq!(
            soa.to_zone_text(),
            "ns1.example.com hostmaster.example.com 2024010101 7200 1800 1209600 300"
        );
    }

    #[test]
    fn mx_zone_text_includes_preference() {
        let mx = ResourceData::MX {
            preference: 10,
            exchange: "mail.example.com".into(),
        };
        assert_eq!(mx.to_zone_text(), "10 mail.example.com");
    }

    #[test]
    fn tsig_rdata_is_never_compressed() {
        let tsig = ResourceData::TSIG {
            algorithm_name: "hmac-sha256".into(),
            time_signed: 1700000000,
            fudge: 300,
            mac: vec![0xAB; 32].into(),
            original_id: 42,
            error: 0,
            other_data: Cow::Borrowed(&[]),
        };
        let mut buf = ByteBuf::new_empty(None);
        let mut cache = HashMap::new();
        // Prime the cache so compression would kick in if it were allowed
        buf.write_qname("hmac-sha256", Some(&mut cache)).unwrap();
        let rdata_start = buf.len();
        tsig.encode_to_buf_with_cache(&mut buf, Some(&mut cache)).unwrap();
        // The algorithm name right after RDLENGTH must be a full label,
        // not a 0xC0 pointer to the cached copy
        assert_eq!(buf[rdata_start + 2], "hmac-sha256".len() as u8);
    }

    proptest! {
        #[test]
        fn resource_data_roundtrip(resource_data in arb_resource_data()) {
            let qtype = resource_data.get_record_type();
            let mut buf = ByteBuf::new_empty(None);
            resource_data.encode_to_buf(&mut buf).expect("shouldn't have failed");
            let roundtripped_rd = ResourceData::from_buf_with_type(&mut buf, qtype).expect("shouldn't have failed");
            prop_assert_eq!(resource_data, roundtripped_rd, "ResourceData roundtrip test failed");
        }

        #[test]
        fn resource_record_roundtrip(resource_record in arb_resource_record()) {
            let mut buf = ByteBuf::new_empty(None);
            resource_record.encode_to_buf(&mut buf).expect("shouldn't have failed");
            let roundtripped_rr = ResourceRecord::from_buf(&mut buf).expect("shouldn't have failed");
            prop_assert_eq!(resource_record, roundtripped_rr, "ResourceRecord roundtrip test failed");
        }
    }
}
