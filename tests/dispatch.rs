//! End-to-end dispatcher behavior against recording upstream doubles.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::{Edns, Message, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};

use switchback::cache::ResponseCache;
use switchback::dispatcher::Fallback;
use switchback::dns::{address_response, answer_addresses, response_to};
use switchback::hosts::HostsTable;
use switchback::matcher::{DomainList, IpNetworkList};
use switchback::upstream::{EcsPolicy, Protocol, Upstream, UpstreamClient, ecs};
use switchback::{Dispatcher, DispatcherConfig, Error, Result};

const PRIMARY: &str = "primary";
const ALTERNATIVE: &str = "alternative";

/// What a fake upstream does with every query.
#[derive(Clone)]
enum Behavior {
    Answer { ips: Vec<IpAddr>, ttl: u32 },
    Rcode(ResponseCode),
    Fail,
}

fn answer(ips: &[&str]) -> Behavior {
    Behavior::Answer {
        ips: ips.iter().map(|ip| ip.parse().unwrap()).collect(),
        ttl: 300,
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Call {
    upstream: String,
    qtype: RecordType,
    ecs_ip: Option<IpAddr>,
}

struct FakeUpstreams {
    primary: Behavior,
    primary_delay: Duration,
    alternative: Behavior,
    alternative_delay: Duration,
    calls: Mutex<Vec<Call>>,
}

impl FakeUpstreams {
    fn new(primary: Behavior, alternative: Behavior) -> Self {
        Self {
            primary,
            primary_delay: Duration::ZERO,
            alternative,
            alternative_delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn with_delays(mut self, primary: Duration, alternative: Duration) -> Self {
        self.primary_delay = primary;
        self.alternative_delay = alternative;
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn called(&self, upstream: &str) -> bool {
        self.calls().iter().any(|call| call.upstream == upstream)
    }
}

#[async_trait]
impl UpstreamClient for FakeUpstreams {
    async fn exchange(
        &self,
        request: &Message,
        upstream: &Upstream,
        ecs_ip: Option<IpAddr>,
    ) -> Result<Message> {
        self.calls.lock().unwrap().push(Call {
            upstream: upstream.name.clone(),
            qtype: request.queries()[0].query_type(),
            ecs_ip,
        });

        let (behavior, delay) = if upstream.name == PRIMARY {
            (&self.primary, self.primary_delay)
        } else {
            (&self.alternative, self.alternative_delay)
        };
        tokio::time::sleep(delay).await;

        match behavior {
            Behavior::Answer { ips, ttl } => {
                // Resolvers echo the query's OPT record, subnet included.
                let mut query = request.clone();
                ecs::apply(&mut query, ecs_ip);
                let mut response = address_response(&query, ips, *ttl);
                *response.extensions_mut() = query.extensions().clone();
                Ok(response)
            }
            Behavior::Rcode(rcode) => Ok(response_to(request, *rcode)),
            Behavior::Fail => Err(Error::Timeout {
                upstream: upstream.name.clone(),
                timeout: Duration::from_secs(1),
            }),
        }
    }
}

fn config() -> DispatcherConfig {
    DispatcherConfig::new(
        Upstream::new(PRIMARY, "192.0.2.53:53", Protocol::Udp),
        Upstream::new(ALTERNATIVE, "198.51.100.53:53", Protocol::Udp),
    )
}

fn dispatcher(config: DispatcherConfig, fake: &Arc<FakeUpstreams>) -> Dispatcher {
    Dispatcher::new(config, Arc::clone(fake) as Arc<dyn UpstreamClient>)
}

fn request(name: &str, qtype: RecordType) -> Message {
    let name = Name::from_str(name)
        .or_else(|_| Name::from_labels(vec![name.as_bytes()]))
        .unwrap();
    let mut message = Message::new();
    message.set_id(0xbeef).set_recursion_desired(true);
    message.add_query(Query::query(name, qtype));
    message
}

fn addresses(response: &Message) -> Vec<IpAddr> {
    answer_addresses(response).collect()
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn assert_answers_request(response: &Message) {
    assert_eq!(response.id(), 0xbeef);
    assert!(response.recursion_desired());
    assert!(response.recursion_available());
    assert_eq!(response.queries().len(), 1);
}

#[tokio::test]
async fn hosts_entry_is_answered_without_upstreams() {
    let fake = Arc::new(FakeUpstreams::new(Behavior::Fail, Behavior::Fail));
    let mut config = config();
    config.hosts = HostsTable::parse("10.0.0.5 nas.lan\nfd00::5 nas.lan\n");
    let dispatcher = dispatcher(config, &fake);

    let v4 = dispatcher.exchange(&request("nas.lan.", RecordType::A), None).await;
    let v6 = dispatcher.exchange(&request("NAS.lan.", RecordType::AAAA), None).await;

    assert_answers_request(&v4);
    assert_eq!(addresses(&v4), vec![ip("10.0.0.5")]);
    assert_eq!(addresses(&v6), vec![ip("fd00::5")]);
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn hosts_entry_of_other_family_falls_through() {
    let fake = Arc::new(FakeUpstreams::new(answer(&["2001:db8::9"]), Behavior::Fail));
    let mut config = config();
    config.hosts = HostsTable::parse("10.0.0.5 nas.lan\n");
    config.only_primary = true;
    let dispatcher = dispatcher(config, &fake);

    let response = dispatcher.exchange(&request("nas.lan.", RecordType::AAAA), None).await;

    assert_eq!(addresses(&response), vec![ip("2001:db8::9")]);
    assert!(fake.called(PRIMARY));
}

#[tokio::test]
async fn ipv4_literal_is_echoed() {
    let fake = Arc::new(FakeUpstreams::new(Behavior::Fail, Behavior::Fail));
    let dispatcher = dispatcher(config(), &fake);

    let a = dispatcher.exchange(&request("192.0.2.10.", RecordType::A), None).await;
    let aaaa = dispatcher.exchange(&request("192.0.2.10.", RecordType::AAAA), None).await;

    assert_answers_request(&a);
    assert_eq!(addresses(&a), vec![ip("192.0.2.10")]);
    assert_eq!(aaaa.response_code(), ResponseCode::NoError);
    assert!(aaaa.answers().is_empty());
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn ipv6_literal_is_echoed() {
    let fake = Arc::new(FakeUpstreams::new(Behavior::Fail, Behavior::Fail));
    let dispatcher = dispatcher(config(), &fake);

    let response = dispatcher
        .exchange(&request("fe80::7f:4f42:3f4d:f4c8", RecordType::AAAA), None)
        .await;

    assert_eq!(addresses(&response), vec![ip("fe80::7f:4f42:3f4d:f4c8")]);
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn primary_listed_domain_only_contacts_primary() {
    let fake = Arc::new(FakeUpstreams::new(answer(&["198.51.100.9"]), answer(&["203.0.113.5"])));
    let mut config = config();
    config.domain_primary = DomainList::parse("example.cn\n");
    config.ip_network_primary = IpNetworkList::parse("203.0.113.0/24\n");
    let dispatcher = dispatcher(config, &fake);

    let response = dispatcher.exchange(&request("www.example.cn.", RecordType::A), None).await;

    assert_eq!(addresses(&response), vec![ip("198.51.100.9")]);
    assert!(fake.called(PRIMARY));
    assert!(!fake.called(ALTERNATIVE));
}

#[tokio::test]
async fn alternative_listed_domain_drops_aaaa_when_redirecting() {
    let fake = Arc::new(FakeUpstreams::new(answer(&["2001:db8::1"]), answer(&["2001:db8::2"])));
    let mut config = config();
    config.domain_alternative = DomainList::parse("example.org\n");
    config.redirect_ipv6 = true;
    let dispatcher = dispatcher(config, &fake);

    let aaaa = dispatcher.exchange(&request("www.example.org.", RecordType::AAAA), None).await;

    assert_answers_request(&aaaa);
    assert_eq!(aaaa.response_code(), ResponseCode::NoError);
    assert!(aaaa.answers().is_empty());
    assert!(!fake.called(PRIMARY));
    assert!(fake.called(ALTERNATIVE));
    assert_eq!(fake.calls()[0].qtype, RecordType::AAAA);
}

#[tokio::test]
async fn alternative_listed_domain_keeps_aaaa_without_redirect() {
    let fake = Arc::new(FakeUpstreams::new(Behavior::Fail, answer(&["2001:db8::2"])));
    let mut config = config();
    config.domain_alternative = DomainList::parse("example.org\n");
    let dispatcher = dispatcher(config, &fake);

    let aaaa = dispatcher.exchange(&request("www.example.org.", RecordType::AAAA), None).await;

    assert_eq!(addresses(&aaaa), vec![ip("2001:db8::2")]);
}

#[tokio::test]
async fn raced_aaaa_from_alternative_is_dropped_when_redirecting() {
    let fake = Arc::new(FakeUpstreams::new(answer(&["2001:db8::1"]), answer(&["2001:db8::2"])));
    let mut config = config();
    config.redirect_ipv6 = true;
    config.ip_network_primary = IpNetworkList::parse("203.0.113.0/24\n");
    let dispatcher = dispatcher(config, &fake);

    let aaaa = dispatcher.exchange(&request("example.net.", RecordType::AAAA), None).await;

    assert!(aaaa.answers().is_empty());
    assert!(fake.called(PRIMARY));
    assert!(fake.called(ALTERNATIVE));
}

#[tokio::test]
async fn cache_hit_skips_upstreams() {
    let fake = Arc::new(FakeUpstreams::new(answer(&["203.0.113.5"]), answer(&["198.51.100.9"])));
    let mut config = config();
    config.cache = Some(ResponseCache::new(128));
    config.ip_network_primary = IpNetworkList::parse("203.0.113.0/24\n");
    let dispatcher = dispatcher(config, &fake);

    let first = dispatcher.exchange(&request("example.com.", RecordType::A), None).await;
    let calls_after_first = fake.calls().len();

    let mut again = request("example.com.", RecordType::A);
    again.set_id(0x0101);
    let start = Instant::now();
    let second = dispatcher.exchange(&again, None).await;
    let elapsed = start.elapsed();

    assert_eq!(calls_after_first, 2);
    assert_eq!(fake.calls().len(), calls_after_first);
    assert!(elapsed < Duration::from_millis(10), "cache hit took {elapsed:?}");
    assert_eq!(addresses(&second), addresses(&first));
    assert_eq!(second.id(), 0x0101);
    assert_eq!(dispatcher.cache_len(), 1);
}

#[tokio::test]
async fn empty_answers_are_not_cached() {
    let fake = Arc::new(FakeUpstreams::new(
        Behavior::Rcode(ResponseCode::NXDomain),
        Behavior::Rcode(ResponseCode::NXDomain),
    ));
    let mut config = config();
    config.cache = Some(ResponseCache::new(128));
    let dispatcher = dispatcher(config, &fake);

    dispatcher.exchange(&request("missing.example.", RecordType::A), None).await;
    dispatcher.exchange(&request("missing.example.", RecordType::A), None).await;

    assert_eq!(fake.calls().len(), 4);
    assert_eq!(dispatcher.cache_len(), 0);
}

#[tokio::test]
async fn trusted_primary_wins_race() {
    let fake = Arc::new(
        FakeUpstreams::new(answer(&["203.0.113.5"]), answer(&["198.51.100.9"]))
            .with_delays(Duration::from_millis(30), Duration::ZERO),
    );
    let mut config = config();
    config.ip_network_primary = IpNetworkList::parse("203.0.113.0/24\n");
    let dispatcher = dispatcher(config, &fake);

    let response = dispatcher.exchange(&request("example.com.", RecordType::A), None).await;

    assert_answers_request(&response);
    assert_eq!(addresses(&response), vec![ip("203.0.113.5")]);
}

#[tokio::test]
async fn untrusted_primary_loses_race() {
    let fake = Arc::new(
        FakeUpstreams::new(answer(&["198.51.100.9"]), answer(&["203.0.113.5"]))
            .with_delays(Duration::ZERO, Duration::from_millis(30)),
    );
    let mut config = config();
    config.ip_network_primary = IpNetworkList::parse("203.0.113.0/24\n");
    let dispatcher = dispatcher(config, &fake);

    let response = dispatcher.exchange(&request("example.com.", RecordType::A), None).await;

    assert_eq!(addresses(&response), vec![ip("203.0.113.5")]);
}

#[tokio::test]
async fn race_outcome_follows_network_list_membership() {
    let fake = Arc::new(FakeUpstreams::new(answer(&["203.0.113.5"]), answer(&["198.51.100.9"])));
    let mut config = config();
    config.ip_network_primary = IpNetworkList::parse("198.51.100.0/24\n");
    let dispatcher = dispatcher(config, &fake);

    let response = dispatcher.exchange(&request("example.com.", RecordType::A), None).await;

    assert_eq!(addresses(&response), vec![ip("198.51.100.9")]);
}

#[tokio::test]
async fn failing_racer_does_not_fail_exchange() {
    let fake = Arc::new(FakeUpstreams::new(Behavior::Fail, answer(&["198.51.100.9"])));
    let dispatcher = dispatcher(config(), &fake);

    let response = dispatcher.exchange(&request("example.com.", RecordType::A), None).await;

    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(addresses(&response), vec![ip("198.51.100.9")]);
}

#[tokio::test]
async fn total_failure_is_servfail() {
    let fake = Arc::new(FakeUpstreams::new(Behavior::Fail, Behavior::Fail));
    let dispatcher = dispatcher(config(), &fake);

    let response = dispatcher.exchange(&request("example.com.", RecordType::A), None).await;

    assert_answers_request(&response);
    assert_eq!(response.response_code(), ResponseCode::ServFail);
    assert!(response.answers().is_empty());
}

#[tokio::test]
async fn nxdomain_is_passed_on() {
    let fake = Arc::new(FakeUpstreams::new(
        Behavior::Rcode(ResponseCode::NXDomain),
        Behavior::Fail,
    ));
    let dispatcher = dispatcher(config(), &fake);

    let response = dispatcher.exchange(&request("missing.example.", RecordType::A), None).await;

    assert_answers_request(&response);
    assert_eq!(response.response_code(), ResponseCode::NXDomain);
}

#[tokio::test]
async fn empty_primary_falls_back_to_alternative() {
    let fake = Arc::new(FakeUpstreams::new(
        Behavior::Rcode(ResponseCode::NXDomain),
        answer(&["198.51.100.9"]),
    ));
    let mut config = config();
    config.only_primary = true;
    config.fallback = Fallback::Alternative;
    let dispatcher = dispatcher(config, &fake);

    let response = dispatcher.exchange(&request("example.com.", RecordType::A), None).await;

    assert_eq!(addresses(&response), vec![ip("198.51.100.9")]);
    assert!(fake.called(ALTERNATIVE));
}

#[tokio::test]
async fn only_primary_without_fallback_keeps_primary_answer() {
    let fake = Arc::new(FakeUpstreams::new(
        Behavior::Rcode(ResponseCode::NXDomain),
        answer(&["198.51.100.9"]),
    ));
    let mut config = config();
    config.only_primary = true;
    let dispatcher = dispatcher(config, &fake);

    let response = dispatcher.exchange(&request("example.com.", RecordType::A), None).await;

    assert_eq!(response.response_code(), ResponseCode::NXDomain);
    assert!(!fake.called(ALTERNATIVE));
}

#[tokio::test]
async fn minimum_ttl_raises_short_ttls() {
    let fake = Arc::new(FakeUpstreams::new(
        Behavior::Answer {
            ips: vec![ip("192.0.2.1")],
            ttl: 5,
        },
        Behavior::Fail,
    ));
    let mut config = config();
    config.only_primary = true;
    config.minimum_ttl = 600;
    let dispatcher = dispatcher(config, &fake);

    let response = dispatcher.exchange(&request("example.com.", RecordType::A), None).await;

    assert_eq!(response.answers()[0].ttl(), 600);
    assert!(matches!(response.answers()[0].data(), Some(RData::A(_))));
}

#[tokio::test]
async fn rejected_qtype_gets_empty_answer() {
    let fake = Arc::new(FakeUpstreams::new(answer(&["192.0.2.1"]), answer(&["192.0.2.2"])));
    let mut config = config();
    config.reject_qtypes = vec![RecordType::ANY];
    let dispatcher = dispatcher(config, &fake);

    let response = dispatcher.exchange(&request("example.com.", RecordType::ANY), None).await;

    assert_answers_request(&response);
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert!(response.answers().is_empty());
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn request_without_question_is_formerr() {
    let fake = Arc::new(FakeUpstreams::new(Behavior::Fail, Behavior::Fail));
    let dispatcher = dispatcher(config(), &fake);
    let mut empty = Message::new();
    empty.set_id(0xbeef);

    let response = dispatcher.exchange(&empty, None).await;

    assert_eq!(response.id(), 0xbeef);
    assert_eq!(response.response_code(), ResponseCode::FormErr);
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn client_subnet_follows_each_upstream_policy() {
    let fake = Arc::new(FakeUpstreams::new(answer(&["192.0.2.1"]), answer(&["192.0.2.2"])));
    let mut config = config();
    config.primary = config.primary.with_ecs(EcsPolicy::Auto {
        external_ip: Some(ip("203.0.113.1")),
    });
    let dispatcher = dispatcher(config, &fake);

    dispatcher
        .exchange(&request("a.example.", RecordType::A), Some(ip("198.51.100.77")))
        .await;
    dispatcher
        .exchange(&request("b.example.", RecordType::A), Some(ip("192.168.1.2")))
        .await;

    let ecs = |upstream: &str| -> Vec<Option<IpAddr>> {
        fake.calls()
            .into_iter()
            .filter(|call| call.upstream == upstream)
            .map(|call| call.ecs_ip)
            .collect()
    };
    assert_eq!(ecs(PRIMARY), vec![Some(ip("198.51.100.77")), Some(ip("203.0.113.1"))]);
    assert_eq!(ecs(ALTERNATIVE), vec![None, None]);
}

#[tokio::test]
async fn upstream_subnet_never_reaches_clients() {
    let fake = Arc::new(FakeUpstreams::new(answer(&["192.0.2.1"]), Behavior::Fail));
    let mut config = config();
    config.only_primary = true;
    config.cache = Some(ResponseCache::new(128));
    config.primary = config.primary.with_ecs(EcsPolicy::Auto { external_ip: None });
    let primary = config.primary.clone();
    let dispatcher = dispatcher(config, &fake);

    let first = dispatcher
        .exchange(&request("example.com.", RecordType::A), Some(ip("198.51.100.77")))
        .await;
    let second = dispatcher
        .exchange(&request("example.com.", RecordType::A), Some(ip("8.8.4.4")))
        .await;
    let mut with_opt = request("example.com.", RecordType::A);
    with_opt.set_edns(Edns::new());
    let third = dispatcher.exchange(&with_opt, Some(ip("8.8.4.4"))).await;

    assert_eq!(fake.calls().len(), 1);
    assert!(first.extensions().is_none());
    assert!(second.extensions().is_none());
    assert!(third.extensions().is_some());
    assert_eq!(ecs::client_subnet(&third), None);
    assert_eq!(addresses(&second), vec![ip("192.0.2.1")]);

    let raw = fake
        .exchange(&request("example.com.", RecordType::A), &primary, Some(ip("198.51.100.77")))
        .await
        .unwrap();
    assert_eq!(ecs::client_subnet(&raw), Some(ip("198.51.100.0")));
}

#[tokio::test]
async fn stats_count_by_source() {
    let fake = Arc::new(FakeUpstreams::new(answer(&["192.0.2.1"]), Behavior::Fail));
    let mut config = config();
    config.ip_network_primary = IpNetworkList::parse("192.0.2.0/24\n");
    let dispatcher = dispatcher(config, &fake);

    dispatcher.exchange(&request("192.0.2.10.", RecordType::A), None).await;
    dispatcher.exchange(&request("example.com.", RecordType::A), None).await;

    let stats = dispatcher.stats_snapshot_and_reset();
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.literal, 1);
    assert_eq!(stats.primary, 1);
}
