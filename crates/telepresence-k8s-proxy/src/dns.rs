use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use rand::Rng;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Queries against kube-dns are expected to be fast; anything slower and we
/// fall back to the ordinary resolver path.
const KUBE_DNS_TIMEOUT: Duration = Duration::from_millis(100);
const FORWARD_TIMEOUT: Duration = Duration::from_secs(2);

/// How the repeater reaches the outside world, fixed at startup.
#[derive(Debug, Clone)]
pub struct DnsConfig {
    pub namespace: String,
    /// First nameserver of the pod's resolv.conf; queries for cluster names
    /// go straight here.
    pub kube_dns: Option<Ipv4Addr>,
    /// Upstreams for everything else. With TELEPRESENCE_NAMESERVER set this
    /// is a server the *workstation* does not use, so the firewall redirect
    /// can never capture our own queries and loop them back (local VMs).
    pub fallback: Vec<Ipv4Addr>,
    /// TELEPRESENCE_NAMESERVER was set: avoid the system resolver for
    /// non-cluster names, it would feed the loop described above.
    pub noloop: bool,
    pub local_names: Vec<String>,
}

impl DnsConfig {
    pub fn from_pod(namespace: String) -> anyhow::Result<DnsConfig> {
        let resolv = std::fs::read_to_string("/etc/resolv.conf").unwrap_or_default();
        let nameservers = nameservers_of(&resolv);
        let kube_dns = nameservers.first().copied();
        let (fallback, noloop) = match std::env::var("TELEPRESENCE_NAMESERVER") {
            Ok(server) if !server.is_empty() => (vec![server.parse()?], true),
            _ => (nameservers, false),
        };
        let local_names = std::env::var("TELEPRESENCE_LOCAL_NAMES")
            .unwrap_or_default()
            .split(',')
            .filter(|name| !name.is_empty())
            .map(|name| name.to_lowercase())
            .collect();
        Ok(DnsConfig {
            namespace,
            kube_dns,
            fallback,
            noloop,
            local_names,
        })
    }
}

fn nameservers_of(resolv_conf: &str) -> Vec<Ipv4Addr> {
    resolv_conf
        .lines()
        .filter_map(|line| {
            let lowered = line.to_lowercase();
            let mut parts = lowered.split_whitespace();
            if parts.next() == Some("nameserver") {
                parts.next()?.parse().ok()
            } else {
                None
            }
        })
        .collect()
}

/// Shared resolver state: the configuration plus the search-suffix set
/// learned from probe queries. The set only grows during a session.
pub struct DnsState {
    pub config: DnsConfig,
    suffixes: Mutex<HashSet<Vec<String>>>,
}

impl DnsState {
    pub fn new(config: DnsConfig) -> DnsState {
        DnsState {
            config,
            suffixes: Mutex::new(HashSet::new()),
        }
    }

    /// Record a suffix observed on a probe; true if it is new.
    pub fn add_suffix(&self, suffix: Vec<String>) -> bool {
        self.suffixes.lock().unwrap().insert(suffix)
    }

    /// Strip the longest known suffix from the right of `labels`, if any
    /// matches.
    pub fn strip_suffix(&self, labels: &[String]) -> Option<Vec<String>> {
        let suffixes = self.suffixes.lock().unwrap();
        let best = suffixes
            .iter()
            .filter(|suffix| {
                suffix.len() < labels.len() && labels[labels.len() - suffix.len()..] == suffix[..]
            })
            .max_by_key(|suffix| suffix.len())?;
        Some(labels[..labels.len() - best.len()].to_vec())
    }
}

/// Answer DNS queries on the repeater socket forever.
pub async fn serve(socket: UdpSocket, state: Arc<DnsState>) -> anyhow::Result<()> {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; 4096];
    loop {
        let (len, peer) = socket.recv_from(&mut buf).await?;
        let packet = buf[..len].to_vec();
        let socket = socket.clone();
        let state = state.clone();
        tokio::spawn(async move {
            if let Some(response) = handle_packet(&state, &packet).await {
                let _ = socket.send_to(&response, peer).await;
            }
        });
    }
}

async fn handle_packet(state: &Arc<DnsState>, packet: &[u8]) -> Option<Vec<u8>> {
    let query = Message::from_vec(packet).ok()?;
    let question = query.queries().first()?.clone();
    let real_name = question.name().clone();
    match question.query_type() {
        RecordType::A => resolve_a(state, &query, real_name).await,
        RecordType::AAAA => {
            // Kubernetes can't do IPv6, and an empty success makes macOS
            // (Happy Eyeballs) give up entirely; answer with A records.
            debug!("AAAA query, sending back A instead: {}", real_name);
            resolve_a(state, &query, real_name).await
        }
        other => {
            debug!("{:?} query: {}", other, real_name);
            forward_raw(state, packet).await
        }
    }
}

/// The A-query pipeline: probe detection, suffix stripping, cluster-name
/// rewriting, then plain pod-local resolution.
async fn resolve_a(state: &Arc<DnsState>, query: &Message, real_name: Name) -> Option<Vec<u8>> {
    let labels = labels_of(&real_name);
    if labels.is_empty() {
        return Some(error_response(query, ResponseCode::FormErr));
    }

    // Synthetic probes sent by the local side teach us the client's search
    // suffixes, which would otherwise mask cluster names: with `search
    // example.com` a query for `myservice` arrives as
    // `myservice.example.com`.
    if labels[0].starts_with("hellotelepresence") {
        if labels.len() > 1 && state.add_suffix(labels[1..].to_vec()) {
            info!("Set DNS suffix we filter out to: {:?}", labels[1..].to_vec());
        }
        return Some(localhost_answer(query, &real_name));
    }

    if state.config.local_names.contains(&labels.join(".")) {
        return Some(localhost_answer(query, &real_name));
    }

    let (effective, stripped) = match state.strip_suffix(&labels) {
        Some(stripped) => {
            info!(
                "Updated query from {} to {}",
                labels.join("."),
                stripped.join(".")
            );
            (stripped, true)
        }
        None => (labels, false),
    };

    if let Some(response) = resolve_a_labels(state, query, &effective, &real_name).await {
        return Some(response);
    }
    if stripped {
        // The stripped name came up empty; retry the original as-is.
        debug!("Stripped lookup failed, falling back to {}", real_name);
        if let Some(response) = forward_raw_message(state, query).await {
            return Some(response);
        }
    }
    Some(error_response(query, ResponseCode::NXDomain))
}

async fn resolve_a_labels(
    state: &Arc<DnsState>,
    query: &Message,
    labels: &[String],
    real_name: &Name,
) -> Option<Vec<u8>> {
    let is_cluster_shaped = labels.len() <= 2 || labels.last().map(String::as_str) == Some("local");
    if is_cluster_shaped {
        if let Some(response) = kube_query(state, query, labels, real_name).await {
            return Some(response);
        }
        // Not a cluster name after all; fall through.
    }
    if state.config.noloop {
        return forward_raw_message(state, query).await;
    }

    // Resolve the way any pod-local client would (search and ndots apply).
    let name = labels.join(".");
    let ips = resolve_ipv4(&name).await;
    if ips.is_empty() {
        debug!("No result for {}", name);
        return None;
    }
    debug!("Result for {} is {:?}", name, ips);
    Some(answers_response(query, real_name, &ips))
}

/// Resolve `<name>` (or `<name>.<namespace>`) against kube-dns directly as
/// `<n>.<ns>.svc.cluster.local`, rewriting the answers back to the name the
/// client asked for. Short timeout; this server is supposed to be close.
async fn kube_query(
    state: &Arc<DnsState>,
    query: &Message,
    labels: &[String],
    real_name: &Name,
) -> Option<Vec<u8>> {
    let kube_dns = state.config.kube_dns?;
    let target = rewrite_kube_name(labels, &state.config.namespace);
    debug!("Resolving {} via kube-dns", target);

    let mut outgoing = Message::new();
    outgoing
        .set_id(rand::thread_rng().gen())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    let name = Name::from_utf8(format!("{}.", target)).ok()?;
    outgoing.add_query(hickory_proto::op::Query::query(name, RecordType::A));

    let reply = exchange(&outgoing.to_vec().ok()?, kube_dns, KUBE_DNS_TIMEOUT).await?;
    let reply = Message::from_vec(&reply).ok()?;
    if reply.response_code() != ResponseCode::NoError || reply.answer_count() == 0 {
        debug!("kube-dns found nothing for {}", target);
        return None;
    }

    // Rewrite the names so the client accepts the answers for what it asked.
    let mut response = response_skeleton(query);
    for answer in reply.answers() {
        let mut answer = answer.clone();
        answer.set_name(real_name.clone());
        response.add_answer(answer);
    }
    response.to_vec().ok()
}

/// `<n1>` becomes `<n1>.<namespace>.svc.cluster.local`; `<n1>.<n2>` becomes
/// `<n1>.<n2>.svc.cluster.local`; `.local` names pass through.
pub fn rewrite_kube_name(labels: &[String], namespace: &str) -> String {
    if labels.last().map(String::as_str) == Some("local") {
        return labels.join(".");
    }
    let service = &labels[0];
    let namespace = labels.get(1).map(String::as_str).unwrap_or(namespace);
    format!("{}.{}.svc.cluster.local", service, namespace)
}

/// Relay the query bytes to the fallback upstreams unchanged.
async fn forward_raw(state: &Arc<DnsState>, packet: &[u8]) -> Option<Vec<u8>> {
    for &server in &state.config.fallback {
        if let Some(reply) = exchange(packet, server, FORWARD_TIMEOUT).await {
            return Some(reply);
        }
    }
    warn!("No upstream answered");
    None
}

async fn forward_raw_message(state: &Arc<DnsState>, query: &Message) -> Option<Vec<u8>> {
    forward_raw(state, &query.to_vec().ok()?).await
}

/// One UDP round trip to a DNS server.
async fn exchange(packet: &[u8], server: Ipv4Addr, timeout: Duration) -> Option<Vec<u8>> {
    let attempt = async {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await.ok()?;
        socket.connect((server, 53)).await.ok()?;
        socket.send(packet).await.ok()?;
        let mut buf = vec![0u8; 4096];
        let len = socket.recv(&mut buf).await.ok()?;
        buf.truncate(len);
        Some(buf)
    };
    tokio::time::timeout(timeout, attempt).await.ok()?
}

/// Reverse-resolve an IPv4 address with a PTR query against `server`.
pub async fn reverse_lookup(ip: Ipv4Addr, server: Ipv4Addr) -> Option<String> {
    let octets = ip.octets();
    let arpa = format!(
        "{}.{}.{}.{}.in-addr.arpa.",
        octets[3], octets[2], octets[1], octets[0]
    );
    let mut outgoing = Message::new();
    outgoing
        .set_id(rand::thread_rng().gen())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    outgoing.add_query(hickory_proto::op::Query::query(
        Name::from_utf8(&arpa).ok()?,
        RecordType::PTR,
    ));
    let reply = exchange(&outgoing.to_vec().ok()?, server, FORWARD_TIMEOUT).await?;
    let reply = Message::from_vec(&reply).ok()?;
    reply.answers().iter().find_map(|answer| match answer.data() {
        Some(RData::PTR(ptr)) => {
            let name = ptr.0.to_utf8();
            Some(name.trim_end_matches('.').to_string())
        }
        _ => None,
    })
}

// Response builders

fn response_skeleton(query: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true);
    response.add_queries(query.queries().to_vec());
    response
}

fn answers_response(query: &Message, name: &Name, ips: &[Ipv4Addr]) -> Vec<u8> {
    let mut response = response_skeleton(query);
    for &ip in ips {
        response.add_answer(Record::from_rdata(name.clone(), 0, RData::A(A(ip))));
    }
    response.to_vec().unwrap_or_default()
}

fn localhost_answer(query: &Message, name: &Name) -> Vec<u8> {
    answers_response(query, name, &[Ipv4Addr::LOCALHOST])
}

fn error_response(query: &Message, code: ResponseCode) -> Vec<u8> {
    let mut response = response_skeleton(query);
    response.set_response_code(code);
    response.to_vec().unwrap_or_default()
}

fn labels_of(name: &Name) -> Vec<String> {
    name.iter()
        .map(|label| String::from_utf8_lossy(label).to_lowercase())
        .collect()
}

/// A-record resolution through the system resolver (getaddrinfo), which is
/// what makes search domains and ndots apply.
pub async fn resolve_ipv4(name: &str) -> Vec<std::net::Ipv4Addr> {
    match tokio::net::lookup_host((name, 0)).await {
        Ok(addrs) => addrs
            .filter_map(|addr| match addr.ip() {
                std::net::IpAddr::V4(v4) => Some(v4),
                std::net::IpAddr::V6(_) => None,
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> Arc<DnsState> {
        Arc::new(DnsState::new(DnsConfig {
            namespace: "default".to_string(),
            kube_dns: None,
            fallback: vec![],
            noloop: false,
            local_names: vec!["myapp".to_string()],
        }))
    }

    fn a_query(name: &str) -> Message {
        let mut query = Message::new();
        query
            .set_id(4242)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        query.add_query(hickory_proto::op::Query::query(
            Name::from_utf8(&format!("{}.", name)).unwrap(),
            RecordType::A,
        ));
        query
    }

    #[tokio::test]
    async fn probes_record_the_suffix_and_answer_localhost() {
        let state = state();
        let query = a_query("hellotelepresence-0.corp.example.com");
        let response = resolve_a(&state, &query, query.queries()[0].name().clone())
            .await
            .unwrap();
        let response = Message::from_vec(&response).unwrap();
        assert_eq!(response.id(), 4242);
        assert_eq!(response.answer_count(), 1);
        match response.answers()[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0, Ipv4Addr::LOCALHOST),
            other => panic!("unexpected answer: {:?}", other),
        }
        assert_eq!(
            state.strip_suffix(&[
                "myservice".to_string(),
                "corp".to_string(),
                "example".to_string(),
                "com".to_string(),
            ]),
            Some(vec!["myservice".to_string()])
        );
    }

    #[tokio::test]
    async fn local_names_answer_loopback() {
        let state = state();
        let query = a_query("myapp");
        let response = resolve_a(&state, &query, query.queries()[0].name().clone())
            .await
            .unwrap();
        let response = Message::from_vec(&response).unwrap();
        assert_eq!(response.answer_count(), 1);
    }

    #[test]
    fn longest_suffix_wins() {
        let state = state();
        state.add_suffix(vec!["example".to_string(), "com".to_string()]);
        state.add_suffix(vec![
            "corp".to_string(),
            "example".to_string(),
            "com".to_string(),
        ]);
        let stripped = state
            .strip_suffix(&[
                "svc".to_string(),
                "corp".to_string(),
                "example".to_string(),
                "com".to_string(),
            ])
            .unwrap();
        assert_eq!(stripped, vec!["svc".to_string()]);
        // A name that is nothing but the suffix is left alone.
        assert_eq!(
            state.strip_suffix(&["example".to_string(), "com".to_string()]),
            None
        );
    }

    #[test]
    fn kube_names_gain_the_cluster_suffix() {
        assert_eq!(
            rewrite_kube_name(&["myservice".to_string()], "myspace"),
            "myservice.myspace.svc.cluster.local"
        );
        assert_eq!(
            rewrite_kube_name(&["myservice".to_string(), "other".to_string()], "myspace"),
            "myservice.other.svc.cluster.local"
        );
        assert_eq!(
            rewrite_kube_name(&["thing".to_string(), "local".to_string()], "myspace"),
            "thing.local"
        );
    }

    #[tokio::test]
    async fn aaaa_queries_come_back_as_a_records() {
        let state = state();
        let mut query = Message::new();
        query
            .set_id(7)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query);
        query.add_query(hickory_proto::op::Query::query(
            Name::from_utf8("hellotelepresence-1.").unwrap(),
            RecordType::AAAA,
        ));
        let response = handle_packet(&state, &query.to_vec().unwrap()).await.unwrap();
        let response = Message::from_vec(&response).unwrap();
        assert_eq!(response.answer_count(), 1);
        assert_eq!(response.answers()[0].record_type(), RecordType::A);
    }
}
