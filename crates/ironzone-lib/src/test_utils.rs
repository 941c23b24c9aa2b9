use std::borrow::Cow;
use std::net::{Ipv4Addr, Ipv6Addr};

use prop::strategy::Union;
use proptest::collection::vec;
use proptest::prelude::*;

use crate::{Question, RecordType, ResourceData, ResourceRecord};

prop_compose! {
    pub fn arb_question()(qname in arb_qname(), query_type in arb_record_type(), qclass: u16) -> Question<'static> {
        Question { qname, query_type, qclass }
    }
}

// Arbitrary on RecordType can emit UNKNOWN(x) where x collides with a known
// type and wouldn't survive a roundtrip, so pin UNKNOWN to the reserved value
pub fn arb_record_type() -> impl Strategy<Value = RecordType> {
    any::<RecordType>().prop_map(|qtype| match qtype {
        RecordType::UNKNOWN(_) => RecordType::UNKNOWN(65535),
        other => other,
    })
}

prop_compose! {
    pub fn arb_resource_record()(name in arb_qname(), resource_data in arb_resource_data(), class: u16, ttl: u32) -> ResourceRecord<'static> {
        ResourceRecord { name, class, ttl, resource_data }
    }
}

pub fn arb_resource_data() -> impl Strategy<Value = ResourceData<'static>> {
    let variants = vec![
        vec(any::<u8>(), 1..100)
            .prop_map(Cow::Owned)
            .prop_map(|rdata| ResourceData::UNKNOWN {
                // Use the reserved QTYPE to avoid collisions with QTYPEs that we handle
                qtype: 65535,
                rdata,
            })
            .boxed(),
        any::<Ipv4Addr>().prop_map(|address| ResourceData::A { address }).boxed(),
        arb_qname()
            .prop_map(|qname| ResourceData::NS { ns_domain_name: qname })
            .boxed(),
        arb_qname().prop_map(|qname| ResourceData::CNAME { cname: qname }).boxed(),
        (arb_qname(), arb_qname(), any::<[u32; 5]>())
            .prop_map(|(mname, rname, [serial, refresh, retry, expire, minimum])| ResourceData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            })
            .boxed(),
        arb_qname()
            .prop_map(|qname| ResourceData::PTR { ptr_domain_name: qname })
            .boxed(),
        (any::<u16>(), arb_qname())
            .prop_map(|(preference, exchange)| ResourceData::MX { preference, exchange })
            .boxed(),
        vec(vec(any::<u8>(), 0..255).prop_map(Cow::Owned), 0..4)
            .prop_map(|strings| ResourceData::TXT { strings })
            .boxed(),
        any::<Ipv6Addr>().prop_map(|address| ResourceData::AAAA { address }).boxed(),
        (arb_qname(), 0..(1u64 << 48), any::<u16>(), vec(any::<u8>(), 0..64), any::<u16>(), any::<u16>())
            .prop_map(
                |(algorithm_name, time_signed, fudge, mac, original_id, error)| ResourceData::TSIG {
                    algorithm_name,
                    time_signed,
                    fudge,
                    mac: mac.into(),
                    original_id,
                    error,
                    other_data: Cow::Borrowed(&[]),
                },
            )
            .boxed(),
    ];

    Union::new(variants)
}

pub fn arb_qname() -> impl Strategy<Value = Cow<'static, str>> {
    proptest::string::string_regex(r"(([a-z0-9][a-z0-9-]{1,62}\.)+[a-z0-9]{2,63})|")
        .expect("regex should be valid")
        .prop_map(Cow::Owned)
}
