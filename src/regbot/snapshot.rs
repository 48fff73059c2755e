/// 上一次对账时的 carrier / gateway 快照
///
/// 逐字段比较：先规范化（空字符串视为缺省、按主键排序），再用 `PartialEq` 判断是否变化
use crate::catalog::{Carrier, Gateway};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationSnapshot {
    carriers: Vec<Carrier>,
    gateways: Vec<Gateway>,
}

impl RegistrationSnapshot {
    pub fn new(carriers: Vec<Carrier>, gateways: Vec<Gateway>) -> Self {
        let mut carriers: Vec<Carrier> = carriers.into_iter().map(normalize_carrier).collect();
        carriers.sort_by(|a, b| a.voip_carrier_sid.cmp(&b.voip_carrier_sid));

        let mut gateways: Vec<Gateway> = gateways.into_iter().map(normalize_gateway).collect();
        gateways.sort_by(|a, b| {
            (a.voip_carrier_sid.as_str(), a.sip_gateway_sid.as_str())
                .cmp(&(b.voip_carrier_sid.as_str(), b.sip_gateway_sid.as_str()))
        });

        Self { carriers, gateways }
    }

    pub fn is_empty(&self) -> bool {
        self.carriers.is_empty() && self.gateways.is_empty()
    }

    pub fn carriers(&self) -> &[Carrier] {
        &self.carriers
    }

    pub fn gateways(&self) -> &[Gateway] {
        &self.gateways
    }

    /// (carrier, gateway) 配对，用于逐个启动 Regbot
    pub fn pairs(&self) -> impl Iterator<Item = (&Carrier, &Gateway)> {
        self.gateways.iter().filter_map(move |gw| {
            self.carriers
                .iter()
                .find(|c| c.voip_carrier_sid == gw.voip_carrier_sid)
                .map(|c| (c, gw))
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn normalize_carrier(carrier: Carrier) -> Carrier {
    Carrier {
        account_sid: non_empty(carrier.account_sid),
        service_provider_sid: non_empty(carrier.service_provider_sid),
        register_username: non_empty(carrier.register_username),
        register_password: non_empty(carrier.register_password),
        register_sip_realm: non_empty(carrier.register_sip_realm),
        register_from_user: non_empty(carrier.register_from_user),
        register_from_domain: non_empty(carrier.register_from_domain),
        ..carrier
    }
}

fn normalize_gateway(gateway: Gateway) -> Gateway {
    Gateway {
        protocol: gateway.protocol.to_ascii_lowercase(),
        ..gateway
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn carrier(sid: &str) -> Carrier {
        Carrier {
            voip_carrier_sid: sid.into(),
            account_sid: None,
            service_provider_sid: None,
            name: sid.into(),
            is_active: true,
            requires_register: true,
            register_username: Some("user".into()),
            register_password: Some("pass".into()),
            register_sip_realm: None,
            register_from_user: None,
            register_from_domain: None,
            register_public_ip_in_contact: false,
        }
    }

    fn gateway(sid: &str, carrier: &str) -> Gateway {
        Gateway {
            sip_gateway_sid: sid.into(),
            voip_carrier_sid: carrier.into(),
            ipv4: "10.0.0.1".into(),
            port: Some(5060),
            protocol: "udp".into(),
            use_sips_scheme: false,
            inbound: false,
            outbound: true,
            is_active: true,
            send_options_ping: false,
        }
    }

    #[test]
    fn order_and_empty_strings_do_not_matter() {
        let a = RegistrationSnapshot::new(
            vec![carrier("c1"), carrier("c2")],
            vec![gateway("g2", "c2"), gateway("g1", "c1")],
        );
        let mut c1 = carrier("c1");
        c1.register_sip_realm = Some(String::new());
        let b = RegistrationSnapshot::new(
            vec![carrier("c2"), c1],
            vec![gateway("g1", "c1"), gateway("g2", "c2")],
        );
        assert_eq!(a, b);
    }

    #[test]
    fn any_field_change_is_detected() {
        let base = RegistrationSnapshot::new(vec![carrier("c1")], vec![gateway("g1", "c1")]);

        let mut moved = gateway("g1", "c1");
        moved.port = Some(5080);
        assert_ne!(base, RegistrationSnapshot::new(vec![carrier("c1")], vec![moved]));

        let mut rotated = carrier("c1");
        rotated.register_password = Some("new".into());
        assert_ne!(base, RegistrationSnapshot::new(vec![rotated], vec![gateway("g1", "c1")]));
    }

    #[test]
    fn pairs_join_gateways_to_carriers() {
        let snap = RegistrationSnapshot::new(
            vec![carrier("c1")],
            vec![gateway("g1", "c1"), gateway("g2", "c1"), gateway("g3", "orphan")],
        );
        let pairs: Vec<_> = snap
            .pairs()
            .map(|(c, g)| (c.voip_carrier_sid.clone(), g.sip_gateway_sid.clone()))
            .collect();
        assert_eq!(
            pairs,
            vec![("c1".to_string(), "g1".to_string()), ("c1".to_string(), "g2".to_string())]
        );
        assert!(RegistrationSnapshot::default().is_empty());
    }
}
