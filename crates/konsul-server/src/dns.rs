//! UDP+TCP DNS resolver synthesizing SRV/A answers from the live service
//! registry (spec §4.8).
//!
//! Hand-rolled header/question parsing and label encoding, with a
//! `tokio::spawn`-per-datagram dispatch shape for UDP and a persistent
//! read loop per connection for TCP (which uses the same wire format
//! prefixed by a 2-byte length, RFC 1035 §4.2.2). SRV answers carry
//! Additional-section glue `A` records for their target. Konsul's registry
//! has no notion of instance health weighting, so SRV priority/weight is
//! synthesized by ranking live instances by name: `priority=1`,
//! `weight=100/rank` per spec §4.8.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use konsul_core::Coordinator;
use konsul_core::registry::ServiceEntry;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, error, warn};

const DNS_FLAG_QR: u16 = 0x8000;
const DNS_FLAG_AA: u16 = 0x0400;
const DNS_FLAG_RD: u16 = 0x0100;

const DNS_TYPE_A: u16 = 1;
const DNS_TYPE_SRV: u16 = 33;
const DNS_TYPE_ANY: u16 = 255;

const DNS_CLASS_IN: u16 = 1;
const DNS_RCODE_NXDOMAIN: u16 = 3;
const RECORD_TTL: u32 = 30;

#[derive(Clone)]
pub struct DnsServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub domain: String,
}

pub struct DnsServer {
    config: DnsServerConfig,
    coordinator: Arc<Coordinator>,
}

impl DnsServer {
    pub fn new(config: DnsServerConfig, coordinator: Arc<Coordinator>) -> Self {
        Self { config, coordinator }
    }

    /// Binds both the UDP and TCP listeners and spawns their accept loops.
    pub async fn start(&self) -> anyhow::Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port).parse()?;

        let udp = Arc::new(UdpSocket::bind(addr).await?);
        tracing::info!("DNS server listening on {}/udp", addr);
        let coordinator = self.coordinator.clone();
        let domain = self.config.domain.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                match udp.recv_from(&mut buf).await {
                    Ok((len, src)) => {
                        let query = buf[..len].to_vec();
                        let socket = udp.clone();
                        let coordinator = coordinator.clone();
                        let domain = domain.clone();
                        tokio::spawn(async move {
                            if let Some(response) = handle_query(&query, &coordinator, &domain) {
                                if let Err(e) = socket.send_to(&response, src).await {
                                    warn!("failed to send DNS/udp response: {e}");
                                }
                            }
                        });
                    }
                    Err(e) => error!("DNS/udp receive error: {e}"),
                }
            }
        });

        let tcp = TcpListener::bind(addr).await?;
        tracing::info!("DNS server listening on {}/tcp", addr);
        let coordinator = self.coordinator.clone();
        let domain = self.config.domain.clone();
        tokio::spawn(async move {
            loop {
                match tcp.accept().await {
                    Ok((stream, _peer)) => {
                        let coordinator = coordinator.clone();
                        let domain = domain.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_tcp_connection(stream, &coordinator, &domain).await {
                                debug!("DNS/tcp connection ended: {e}");
                            }
                        });
                    }
                    Err(e) => error!("DNS/tcp accept error: {e}"),
                }
            }
        });

        Ok(())
    }
}

async fn serve_tcp_connection(
    mut stream: tokio::net::TcpStream,
    coordinator: &Arc<Coordinator>,
    domain: &str,
) -> std::io::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(());
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut query = vec![0u8; len];
        stream.read_exact(&mut query).await?;

        if let Some(response) = handle_query(&query, coordinator, domain) {
            let len = (response.len() as u16).to_be_bytes();
            stream.write_all(&len).await?;
            stream.write_all(&response).await?;
        }
    }
}

fn handle_query(query: &[u8], coordinator: &Coordinator, domain: &str) -> Option<Vec<u8>> {
    if query.len() < 12 {
        return None;
    }

    let id = u16::from_be_bytes([query[0], query[1]]);
    let qdcount = u16::from_be_bytes([query[4], query[5]]);
    if qdcount == 0 {
        return None;
    }

    let (qname, qname_end) = parse_name(query, 12)?;
    if qname_end + 4 > query.len() {
        return None;
    }
    let qtype = u16::from_be_bytes([query[qname_end], query[qname_end + 1]]);
    let question_end = qname_end + 4;

    debug!("DNS query: {qname} type={qtype}");

    let Some((service_name, kind)) = parse_query_name(&qname, domain) else {
        return Some(build_nxdomain(id, query, question_end));
    };

    let now = std::time::Instant::now();
    let mut instances: Vec<ServiceEntry> = coordinator
        .registry
        .list_live(now)
        .into_iter()
        .filter(|e| e.name == service_name)
        .collect();
    instances.sort_by(|a, b| a.name.cmp(&b.name));

    if instances.is_empty() {
        return Some(build_nxdomain(id, query, question_end));
    }

    let want_srv = matches!(kind, QueryKind::Srv) || qtype == DNS_TYPE_SRV || qtype == DNS_TYPE_ANY;
    let want_a = matches!(kind, QueryKind::AService | QueryKind::ANode) || qtype == DNS_TYPE_A || qtype == DNS_TYPE_ANY;

    if !want_srv && !want_a {
        return Some(build_nxdomain(id, query, question_end));
    }

    Some(build_response(id, query, question_end, &instances, domain, want_srv, want_a))
}

enum QueryKind {
    Srv,
    AService,
    ANode,
}

/// Recognizes `_<service>._<proto>.service.<domain>` (SRV),
/// `<service>.service.<domain>` (A), and `<service>.node.<domain>` (A).
fn parse_query_name(qname: &str, domain: &str) -> Option<(String, QueryKind)> {
    let suffix_service = format!(".service.{domain}");
    let suffix_node = format!(".node.{domain}");

    if let Some(prefix) = qname.strip_suffix(&suffix_service) {
        if let Some(service) = prefix.strip_prefix('_') {
            if let Some((service, _proto)) = service.split_once("._") {
                return Some((service.to_string(), QueryKind::Srv));
            }
        }
        return Some((prefix.to_string(), QueryKind::AService));
    }

    if let Some(prefix) = qname.strip_suffix(&suffix_node) {
        return Some((prefix.to_string(), QueryKind::ANode));
    }

    None
}

fn parse_name(data: &[u8], offset: usize) -> Option<(String, usize)> {
    let mut name = String::new();
    let mut pos = offset;
    loop {
        if pos >= data.len() {
            return None;
        }
        let len = data[pos] as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        if len & 0xC0 == 0xC0 {
            pos += 2;
            break;
        }
        pos += 1;
        if pos + len > data.len() {
            return None;
        }
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(&data[pos..pos + len]));
        pos += len;
    }
    Some((name.to_lowercase(), pos))
}

fn encode_name(name: &str, out: &mut Vec<u8>) {
    for label in name.split('.') {
        if label.is_empty() {
            continue;
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
}

fn build_nxdomain(id: u16, query: &[u8], question_end: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(question_end + 12);
    out.extend_from_slice(&id.to_be_bytes());
    let flags = DNS_FLAG_QR | DNS_FLAG_AA | DNS_FLAG_RD | DNS_RCODE_NXDOMAIN;
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    out.extend_from_slice(&query[12..question_end]);
    out
}

fn build_response(
    id: u16,
    query: &[u8],
    question_end: usize,
    instances: &[ServiceEntry],
    domain: &str,
    want_srv: bool,
    want_a: bool,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(512);
    out.extend_from_slice(&id.to_be_bytes());

    let flags = DNS_FLAG_QR | DNS_FLAG_AA | DNS_FLAG_RD;
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT

    let answer_count = if want_srv { instances.len() } else { 0 } + if want_a { instances.len() } else { 0 };
    out.extend_from_slice(&(answer_count as u16).to_be_bytes());

    // NSCOUNT = 0; ARCOUNT carries glue A records for SRV answers.
    out.extend_from_slice(&0u16.to_be_bytes());
    let arcount = if want_srv { instances.len() } else { 0 };
    out.extend_from_slice(&(arcount as u16).to_be_bytes());

    out.extend_from_slice(&query[12..question_end]);

    if want_srv {
        for (i, instance) in instances.iter().enumerate() {
            out.extend_from_slice(&[0xC0, 0x0C]); // pointer to question name
            out.extend_from_slice(&DNS_TYPE_SRV.to_be_bytes());
            out.extend_from_slice(&DNS_CLASS_IN.to_be_bytes());
            out.extend_from_slice(&RECORD_TTL.to_be_bytes());

            let target = format!("{}.node.{domain}.", instance.name);
            let mut target_bytes = Vec::new();
            encode_name(&target, &mut target_bytes);

            let rdlength = 6 + target_bytes.len();
            out.extend_from_slice(&(rdlength as u16).to_be_bytes());

            let rank = (i + 1) as u16;
            let weight = 100u16 / rank;
            out.extend_from_slice(&1u16.to_be_bytes()); // priority
            out.extend_from_slice(&weight.to_be_bytes());
            out.extend_from_slice(&instance.port.to_be_bytes());
            out.extend_from_slice(&target_bytes);
        }
    }

    if want_a {
        for instance in instances {
            out.extend_from_slice(&[0xC0, 0x0C]);
            out.extend_from_slice(&DNS_TYPE_A.to_be_bytes());
            out.extend_from_slice(&DNS_CLASS_IN.to_be_bytes());
            out.extend_from_slice(&RECORD_TTL.to_be_bytes());
            out.extend_from_slice(&4u16.to_be_bytes());
            if let Ok(ip) = instance.address.parse::<Ipv4Addr>() {
                out.extend_from_slice(&ip.octets());
            } else {
                out.extend_from_slice(&[0, 0, 0, 0]);
            }
        }
    }

    if want_srv {
        for instance in instances {
            let target = format!("{}.node.{domain}.", instance.name);
            let mut name_bytes = Vec::new();
            encode_name(&target, &mut name_bytes);
            out.extend_from_slice(&name_bytes);
            out.extend_from_slice(&DNS_TYPE_A.to_be_bytes());
            out.extend_from_slice(&DNS_CLASS_IN.to_be_bytes());
            out.extend_from_slice(&RECORD_TTL.to_be_bytes());
            out.extend_from_slice(&4u16.to_be_bytes());
            if let Ok(ip) = instance.address.parse::<Ipv4Addr>() {
                out.extend_from_slice(&ip.octets());
            } else {
                out.extend_from_slice(&[0, 0, 0, 0]);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use konsul_core::registry::ServiceRegistration;

    /// Scenario 5: a registered service answers an SRV query with its port
    /// and target, plus a glue A record resolving that target.
    #[test]
    fn srv_query_resolves_registered_instance_with_glue_record() {
        let coordinator = Coordinator::new(None, std::time::Duration::from_secs(30), 10).unwrap();
        coordinator
            .register_service(
                ServiceRegistration {
                    name: "web".to_string(),
                    address: "10.0.0.1".to_string(),
                    port: 80,
                    tags: Default::default(),
                    meta: Default::default(),
                },
                None,
            )
            .unwrap();

        let mut query = Vec::new();
        query.extend_from_slice(&7u16.to_be_bytes());
        query.extend_from_slice(&DNS_FLAG_RD.to_be_bytes());
        query.extend_from_slice(&1u16.to_be_bytes());
        query.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        let question_start = query.len();
        encode_name("_web._tcp.service.consul", &mut query);
        query.extend_from_slice(&DNS_TYPE_SRV.to_be_bytes());
        query.extend_from_slice(&DNS_CLASS_IN.to_be_bytes());
        let _ = question_start;

        let response = handle_query(&query, &coordinator, "consul").expect("response expected");

        let ancount = u16::from_be_bytes([response[6], response[7]]);
        let arcount = u16::from_be_bytes([response[10], response[11]]);
        assert_eq!(ancount, 1, "one SRV answer");
        assert_eq!(arcount, 1, "one glue A record");
        assert!(response.windows(2).any(|w| w == [0u8, 80u8]), "port 80 present in SRV rdata");
        assert!(
            response.windows(4).any(|w| w == [10, 0, 0, 1]),
            "glue record resolves to the registered address"
        );
    }

    #[test]
    fn parses_srv_query_name() {
        let result = parse_query_name("_web._tcp.service.consul", "consul");
        assert!(matches!(result, Some((ref name, QueryKind::Srv)) if name == "web"));
    }

    #[test]
    fn parses_service_a_query_name() {
        let result = parse_query_name("web.service.consul", "consul");
        assert!(matches!(result, Some((ref name, QueryKind::AService)) if name == "web"));
    }

    #[test]
    fn parses_node_a_query_name() {
        let result = parse_query_name("web.node.consul", "consul");
        assert!(matches!(result, Some((ref name, QueryKind::ANode)) if name == "web"));
    }

    #[test]
    fn rejects_unrelated_domain() {
        assert!(parse_query_name("web.service.example", "consul").is_none());
    }

    #[test]
    fn nxdomain_sets_rcode_and_echoes_question() {
        let mut query = Vec::new();
        query.extend_from_slice(&42u16.to_be_bytes());
        query.extend_from_slice(&DNS_FLAG_RD.to_be_bytes());
        query.extend_from_slice(&1u16.to_be_bytes());
        query.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        encode_name("missing.service.consul", &mut query);
        query.extend_from_slice(&DNS_TYPE_A.to_be_bytes());
        query.extend_from_slice(&DNS_CLASS_IN.to_be_bytes());

        let response = build_nxdomain(42, &query, query.len());
        let flags = u16::from_be_bytes([response[2], response[3]]);
        assert_eq!(flags & 0x000F, DNS_RCODE_NXDOMAIN);
        assert_eq!(u16::from_be_bytes([response[0], response[1]]), 42);
    }
}
