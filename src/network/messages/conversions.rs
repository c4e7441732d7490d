use crate::chord::types::{NodeId, Role};
use crate::error::MessageError;
use crate::network::messages::{Command, Datagram, Envelope};
use std::net::SocketAddr;

fn parse_addr(field: &'static str, value: &str) -> Result<SocketAddr, MessageError> {
    value.parse().map_err(|_| MessageError::InvalidField {
        field,
        value: value.to_string(),
    })
}

impl From<&Datagram> for Envelope {
    fn from(datagram: &Datagram) -> Self {
        let (key, value) = match &datagram.command {
            Command::Discover { joiner } => (joiner.to_string(), String::new()),
            Command::DiscoverAck { successor } => (String::new(), successor.to_string()),
            Command::LocatePredecessor { requester } => (requester.to_string(), String::new()),
            Command::PredecessorAck { predecessor } => {
                (Role::Predecessor.to_string(), predecessor.to_string())
            }
            Command::Proposal { role, proposer } => (role.to_string(), proposer.to_string()),
            Command::ProposalAck { role, candidate } => (role.to_string(), candidate.to_string()),
            Command::Heartbeat { sender }
            | Command::Alive { sender }
            | Command::AliveAck { sender } => (sender.to_string(), String::new()),
            Command::GetInfo { target } => (target.to_string(), String::new()),
            Command::InfoAck { target, owner } => (target.to_string(), owner.to_string()),
            Command::GetValue { key } | Command::ValueMissing { key } | Command::Ack { key } => {
                (key.clone(), String::new())
            }
            Command::ValueAck { key, value } | Command::SetValue { key, value } => {
                (key.clone(), value.clone())
            }
            Command::Evict { node, addr } => (node.to_string(), addr.to_string()),
        };

        Envelope {
            tag: datagram.command.tag().to_string(),
            source_address: datagram.source.to_string(),
            dest_address: datagram.dest.map(|d| d.to_string()).unwrap_or_default(),
            key,
            value,
            request_id: datagram.request_id,
        }
    }
}

impl TryFrom<Envelope> for Datagram {
    type Error = MessageError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let source = parse_addr("sourceAddress", &envelope.source_address)?;
        let dest = match envelope.dest_address.as_str() {
            "" => None,
            other => Some(parse_addr("destAddress", other)?),
        };
        let Envelope { tag, key, value, request_id, .. } = envelope;

        let command = match tag.as_str() {
            "discover" => Command::Discover { joiner: key.parse()? },
            "discover-ack" => Command::DiscoverAck {
                successor: parse_addr("successor", &value)?,
            },
            "locate-predecessor" => Command::LocatePredecessor { requester: key.parse()? },
            "predecessor-ack" => Command::PredecessorAck {
                predecessor: parse_addr("predecessor", &value)?,
            },
            "proposal" => Command::Proposal {
                role: key.parse()?,
                proposer: value.parse()?,
            },
            "proposal-ack" => Command::ProposalAck {
                role: key.parse()?,
                candidate: value.parse()?,
            },
            "heartbeat" => Command::Heartbeat { sender: key.parse()? },
            "alive?" => Command::Alive { sender: key.parse()? },
            "alive-ack" => Command::AliveAck { sender: key.parse()? },
            "get-info" => Command::GetInfo { target: key.parse()? },
            "info-ack" => Command::InfoAck {
                target: key.parse()?,
                owner: parse_addr("owner", &value)?,
            },
            "get-value" => Command::GetValue { key },
            "value-ack" => Command::ValueAck { key, value },
            "value-missing" => Command::ValueMissing { key },
            "set-value" => Command::SetValue { key, value },
            "ack" => Command::Ack { key },
            "evict" => Command::Evict {
                node: key.parse::<NodeId>()?,
                addr: parse_addr("evicted address", &value)?,
            },
            _ => return Err(MessageError::UnknownTag(tag)),
        };

        Ok(Datagram { source, dest, request_id, command })
    }
}

impl Datagram {
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Envelope::from(self).encode()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        Datagram::try_from(Envelope::decode(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn discover_carries_the_joiner_identifier_in_key() {
        let datagram = Datagram::new(addr(6001), Command::Discover { joiner: NodeId(42) });
        let envelope = Envelope::from(&datagram);
        assert_eq!(envelope.tag, "discover");
        assert_eq!(envelope.source_address, "127.0.0.1:6001");
        assert_eq!(envelope.key, "42");
        assert_eq!(envelope.dest_address, "");
    }

    #[test]
    fn decodes_camel_case_json() {
        let raw = br#"{"tag":"set-value","sourceAddress":"127.0.0.1:6001","destAddress":"127.0.0.1:6002","key":"movie.mp4","value":"127.0.0.1:7000"}"#;
        let datagram = Datagram::from_bytes(raw).unwrap();
        assert_eq!(datagram.source, addr(6001));
        assert_eq!(datagram.dest, Some(addr(6002)));
        assert_eq!(
            datagram.command,
            Command::SetValue {
                key: "movie.mp4".into(),
                value: "127.0.0.1:7000".into()
            }
        );
    }

    #[test]
    fn request_id_is_optional_on_the_wire() {
        let plain = Datagram::new(addr(6001), Command::Ack { key: "k".into() });
        let bytes = plain.to_bytes().unwrap();
        assert!(!String::from_utf8_lossy(&bytes).contains("requestId"));
        assert_eq!(Datagram::from_bytes(&bytes).unwrap().request_id, None);

        let tagged = plain.with_request_id(Some(912));
        let bytes = tagged.to_bytes().unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains(r#""requestId":912"#));
        assert_eq!(Datagram::from_bytes(&bytes).unwrap().request_id, Some(912));
    }

    #[test]
    fn proposal_ack_keeps_role_and_candidate() {
        let datagram = Datagram::new(
            addr(6003),
            Command::ProposalAck { role: Role::Successor, candidate: NodeId(7) },
        );
        let decoded = Datagram::from_bytes(&datagram.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, datagram);
    }

    #[test]
    fn rejects_unknown_tags() {
        let raw = br#"{"tag":"_discover","sourceAddress":"127.0.0.1:6001"}"#;
        assert!(matches!(
            Datagram::from_bytes(raw),
            Err(MessageError::UnknownTag(tag)) if tag == "_discover"
        ));
    }

    #[test]
    fn rejects_unknown_roles() {
        let raw = br#"{"tag":"proposal-ack","sourceAddress":"127.0.0.1:6001","key":"cousin","value":"3"}"#;
        assert!(matches!(
            Datagram::from_bytes(raw),
            Err(MessageError::InvalidField { field: "role", .. })
        ));
    }

    #[test]
    fn rejects_bad_addresses_and_identifiers() {
        let bad_source = br#"{"tag":"heartbeat","sourceAddress":"nowhere","key":"1"}"#;
        assert!(Datagram::from_bytes(bad_source).is_err());

        let bad_id = br#"{"tag":"get-info","sourceAddress":"127.0.0.1:1","key":"-4"}"#;
        assert!(Datagram::from_bytes(bad_id).is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            Datagram::from_bytes(&[0xff, 0x00, 0x13, 0x37]),
            Err(MessageError::DeserializationFailed(_))
        ));
        assert!(Datagram::from_bytes(br#"{"tag":"discover","sourceAdd"#).is_err());
    }

    #[test]
    fn refuses_to_encode_oversized_values() {
        let datagram = Datagram::new(
            addr(6001),
            Command::SetValue { key: "k".into(), value: "x".repeat(70_000) },
        );
        assert!(matches!(datagram.to_bytes(), Err(MessageError::TooLarge(_))));
    }
}
