use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};

use crate::codec::Answer;
use crate::config::AddressRuleConfig;
use crate::error::ConfigError;

/// TTL of synthesized address answers.
pub const STATIC_TTL: u32 = 300;

#[derive(Debug, Clone)]
struct AddressRule {
    ips: Vec<IpAddr>,
}

/// Static `domain -> ip` answers, matched on label boundaries: a rule for
/// `example.com` covers `example.com` and `www.example.com`, not `badexample.com`.
#[derive(Debug, Clone, Default)]
pub struct AddressRules {
    by_suffix: HashMap<String, AddressRule>,
}

impl AddressRules {
    pub fn from_config(rules: &[AddressRuleConfig]) -> Result<Self, ConfigError> {
        let mut by_suffix = HashMap::with_capacity(rules.len());
        for rule in rules {
            let domain = rule.domain.trim_matches('.').to_ascii_lowercase();
            if domain.is_empty() {
                return Err(ConfigError::InvalidRule {
                    domain: rule.domain.clone(),
                    reason: "empty domain".into(),
                });
            }
            let ips = rule
                .ips
                .iter()
                .map(|ip| {
                    ip.parse::<IpAddr>().map_err(|e| ConfigError::InvalidRule {
                        domain: rule.domain.clone(),
                        reason: format!("{ip}: {e}"),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            // later rules for the same domain extend earlier ones
            by_suffix
                .entry(domain)
                .or_insert_with(|| AddressRule { ips: Vec::new() })
                .ips
                .extend(ips);
        }
        Ok(Self { by_suffix })
    }

    pub fn is_empty(&self) -> bool {
        self.by_suffix.is_empty()
    }

    /// Static answer for a normalized `qname`, most specific rule first.
    pub fn lookup(&self, qname: &str, qtype: RecordType) -> Option<Answer> {
        if self.by_suffix.is_empty() {
            return None;
        }
        let mut suffix = qname;
        let rule = loop {
            if let Some(rule) = self.by_suffix.get(suffix) {
                break rule;
            }
            suffix = suffix.split_once('.')?.1;
        };

        // 无 IP 的规则表示屏蔽该域名
        if rule.ips.is_empty() {
            return Some(Answer::empty(ResponseCode::NXDomain));
        }
        let mut answer = Answer::empty(ResponseCode::NoError);
        let Ok(name) = Name::from_str(qname) else {
            return Some(Answer::empty(ResponseCode::ServFail));
        };
        for ip in &rule.ips {
            let rdata = match (ip, qtype) {
                (IpAddr::V4(v4), RecordType::A) => RData::A(A(*v4)),
                (IpAddr::V6(v6), RecordType::AAAA) => RData::AAAA(AAAA(*v6)),
                _ => continue,
            };
            answer.answers.push(Record::from_rdata(name.clone(), STATIC_TTL, rdata));
        }
        Some(answer)
    }
}
