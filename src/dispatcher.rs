//! DNS query dispatch.
//!
//! Handles the query pipeline shared by every transport:
//! 1. Rejected query types, hosts table, IP literals (no I/O)
//! 2. Cache lookup
//! 3. Routing by domain list, or racing both upstreams
//! 4. Trust policy and IPv6 redirection
//! 5. Cache store
//!
//! Transports handle the actual I/O, the dispatcher handles decisions.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RecordType;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::cache::ResponseCache;
use crate::dns::{
    Question, SYNTHESIZED_TTL, address_response, adopt, has_answers, response_to, rewrite_ttls,
};
use crate::hosts::HostsTable;
use crate::matcher::{DomainList, IpNetworkList};
use crate::policy::{self, Choice};
use crate::stats::{Source, Stats, StatsSnapshot};
use crate::upstream::{Upstream, UpstreamClient, ecs};

/// Upstream to try when the primary-only route comes back empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fallback {
    /// Keep the primary's (empty) answer.
    #[default]
    Primary,
    /// Ask the alternative upstream instead.
    Alternative,
}

/// Everything the dispatcher needs, fixed at construction.
pub struct DispatcherConfig {
    pub primary: Upstream,
    pub alternative: Upstream,
    /// Send unlisted domains to the primary only instead of racing.
    pub only_primary: bool,
    /// Drop AAAA answers that came from the alternative upstream.
    pub redirect_ipv6: bool,
    pub fallback: Fallback,
    /// Records with a smaller TTL are raised to this; 0 disables.
    pub minimum_ttl: u32,
    /// Query types answered with an empty NOERROR.
    pub reject_qtypes: Vec<RecordType>,
    pub domain_primary: DomainList,
    pub domain_alternative: DomainList,
    /// Addresses a primary answer must fall into to be trusted in a race.
    pub ip_network_primary: IpNetworkList,
    pub hosts: HostsTable,
    pub cache: Option<ResponseCache>,
}

impl DispatcherConfig {
    /// A config that races `primary` against `alternative` with no lists,
    /// hosts or cache.
    pub fn new(primary: Upstream, alternative: Upstream) -> Self {
        Self {
            primary,
            alternative,
            only_primary: false,
            redirect_ipv6: false,
            fallback: Fallback::default(),
            minimum_ttl: 0,
            reject_qtypes: Vec::new(),
            domain_primary: DomainList::new(),
            domain_alternative: DomainList::new(),
            ip_network_primary: IpNetworkList::new(),
            hosts: HostsTable::new(),
            cache: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Primary,
    Alternative,
    Race,
}

/// Answers each request from the shortcuts, the cache or the upstreams.
///
/// Shared between transports behind an `Arc`; only the cache and the
/// counters change after construction.
pub struct Dispatcher {
    primary: Arc<Upstream>,
    alternative: Arc<Upstream>,
    only_primary: bool,
    redirect_ipv6: bool,
    fallback: Fallback,
    minimum_ttl: u32,
    reject_qtypes: Vec<RecordType>,
    domain_primary: DomainList,
    domain_alternative: DomainList,
    ip_network_primary: IpNetworkList,
    hosts: HostsTable,
    cache: Option<ResponseCache>,
    client: Arc<dyn UpstreamClient>,
    stats: Stats,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, client: Arc<dyn UpstreamClient>) -> Self {
        Self {
            primary: Arc::new(config.primary),
            alternative: Arc::new(config.alternative),
            only_primary: config.only_primary,
            redirect_ipv6: config.redirect_ipv6,
            fallback: config.fallback,
            minimum_ttl: config.minimum_ttl,
            reject_qtypes: config.reject_qtypes,
            domain_primary: config.domain_primary,
            domain_alternative: config.domain_alternative,
            ip_network_primary: config.ip_network_primary,
            hosts: config.hosts,
            cache: config.cache,
            client,
            stats: Stats::new(),
        }
    }

    /// Answer `request`, which arrived from `inbound_ip`.
    ///
    /// Never fails: upstream trouble ends up as an empty answer or SERVFAIL.
    /// The response always carries the request's id and query section.
    pub async fn exchange(&self, request: &Message, inbound_ip: Option<IpAddr>) -> Message {
        let start = Instant::now();
        let (response, source) = self.dispatch(request, inbound_ip).await;
        let elapsed = start.elapsed();

        self.stats.record(source, elapsed);
        debug!(
            name = ?request.queries().first().map(|q| q.name().to_string()),
            source = source.as_str(),
            rcode = ?response.response_code(),
            answers = response.answers().len(),
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "Dispatched"
        );

        response
    }

    async fn dispatch(&self, request: &Message, inbound_ip: Option<IpAddr>) -> (Message, Source) {
        let Some(question) = Question::from_message(request) else {
            return (response_to(request, ResponseCode::FormErr), Source::Failure);
        };

        if self.reject_qtypes.contains(&question.qtype) {
            return (response_to(request, ResponseCode::NoError), Source::Rejected);
        }

        if let Some(addresses) = self.hosts.lookup(&question.name, question.qtype) {
            return (
                address_response(request, &addresses, SYNTHESIZED_TTL),
                Source::Hosts,
            );
        }

        if let Some(ip) = question.ip_literal() {
            let response = match (question.qtype, ip) {
                (RecordType::A, IpAddr::V4(_)) | (RecordType::AAAA, IpAddr::V6(_)) => {
                    address_response(request, &[ip], SYNTHESIZED_TTL)
                }
                _ => response_to(request, ResponseCode::NoError),
            };
            return (response, Source::Literal);
        }

        if let Some(cached) = self.cache.as_ref().and_then(|cache| cache.get(&question)) {
            return (adopt(cached, request), Source::Cache);
        }

        let (mut response, source) = self.forward(request, &question, inbound_ip).await;
        if source == Source::Failure {
            return (response, source);
        }

        let redirect = self.redirect_ipv6 && question.qtype == RecordType::AAAA;
        if redirect && source == Source::Alternative {
            debug!(name = %question.name, "Dropping AAAA answer from alternative upstream");
            response.take_answers();
        }

        if self.minimum_ttl > 0 {
            let floor = self.minimum_ttl;
            rewrite_ttls(&mut response, |ttl| ttl.max(floor));
        }

        if let Some(cache) = &self.cache
            && has_answers(&response)
        {
            // The subnet belongs to whichever client asked first.
            ecs::strip(&mut response);
            cache.put(&question, &response);
        }

        (adopt(response, request), source)
    }

    fn route(&self, question: &Question) -> Route {
        if self.domain_primary.matches(&question.name) {
            Route::Primary
        } else if self.domain_alternative.matches(&question.name) {
            Route::Alternative
        } else if self.only_primary {
            Route::Primary
        } else {
            Route::Race
        }
    }

    async fn forward(
        &self,
        request: &Message,
        question: &Question,
        inbound_ip: Option<IpAddr>,
    ) -> (Message, Source) {
        let route = self.route(question);
        debug!(name = %question.name, qtype = %question.qtype, ?route, "Forwarding");

        let (primary, alternative, choice) = match route {
            Route::Primary => {
                let primary = self.query(&self.primary, request, inbound_ip).await;
                if primary.as_ref().is_some_and(has_answers) {
                    (primary, None, Choice::Primary)
                } else if self.fallback == Fallback::Alternative {
                    debug!(name = %question.name, "Primary gave no answer, asking alternative");
                    let alternative = self.query(&self.alternative, request, inbound_ip).await;
                    let choice = if alternative.as_ref().is_some_and(has_answers) {
                        Choice::Alternative
                    } else {
                        Choice::Neither
                    };
                    (primary, alternative, choice)
                } else {
                    (primary, None, Choice::Neither)
                }
            }
            Route::Alternative => {
                let alternative = self.query(&self.alternative, request, inbound_ip).await;
                let choice = if alternative.as_ref().is_some_and(has_answers) {
                    Choice::Alternative
                } else {
                    Choice::Neither
                };
                (None, alternative, choice)
            }
            Route::Race => {
                let (primary, alternative) = self.race(request, inbound_ip).await;
                let choice = policy::select(
                    primary.as_ref(),
                    alternative.as_ref(),
                    &self.ip_network_primary,
                );
                debug!(name = %question.name, ?choice, "Race settled");
                (primary, alternative, choice)
            }
        };

        settle(request, primary, alternative, choice)
    }

    /// Query both upstreams concurrently and wait for both.
    async fn race(
        &self,
        request: &Message,
        inbound_ip: Option<IpAddr>,
    ) -> (Option<Message>, Option<Message>) {
        let primary = tokio::spawn(query_upstream(
            Arc::clone(&self.client),
            Arc::clone(&self.primary),
            request.clone(),
            inbound_ip,
        ));
        let alternative = tokio::spawn(query_upstream(
            Arc::clone(&self.client),
            Arc::clone(&self.alternative),
            request.clone(),
            inbound_ip,
        ));

        let (primary, alternative) = futures::join!(primary, alternative);
        let joined = |result: Result<Option<Message>, tokio::task::JoinError>| {
            result.unwrap_or_else(|e| {
                warn!(error = %e, "Upstream exchange task failed");
                None
            })
        };
        (joined(primary), joined(alternative))
    }

    async fn query(
        &self,
        upstream: &Arc<Upstream>,
        request: &Message,
        inbound_ip: Option<IpAddr>,
    ) -> Option<Message> {
        query_upstream(
            Arc::clone(&self.client),
            Arc::clone(upstream),
            request.clone(),
            inbound_ip,
        )
        .await
    }

    /// Snapshot and reset counters.
    pub fn stats_snapshot_and_reset(&self) -> StatsSnapshot {
        self.stats.snapshot_and_reset()
    }

    /// Returns the number of cached responses.
    pub fn cache_len(&self) -> usize {
        self.cache.as_ref().map_or(0, ResponseCache::len)
    }

    /// Drop expired cache entries, returning how many went.
    pub fn sweep_cache(&self) -> usize {
        self.cache.as_ref().map_or(0, ResponseCache::sweep)
    }

    pub fn primary(&self) -> &Upstream {
        &self.primary
    }

    pub fn alternative(&self) -> &Upstream {
        &self.alternative
    }
}

async fn query_upstream(
    client: Arc<dyn UpstreamClient>,
    upstream: Arc<Upstream>,
    request: Message,
    inbound_ip: Option<IpAddr>,
) -> Option<Message> {
    let ecs_ip = upstream.edns_client_subnet.resolve(inbound_ip);
    match client.exchange(&request, &upstream, ecs_ip).await {
        Ok(response) => Some(response),
        Err(e) => {
            warn!(upstream = %upstream.name, error = %e, "Upstream exchange failed");
            None
        }
    }
}

/// Turn the collected upstream responses into the one to return.
///
/// Without a trusted answer, an empty upstream reply (NXDOMAIN, NODATA) is
/// passed on, primary's first; with nothing at all the client gets SERVFAIL.
fn settle(
    request: &Message,
    primary: Option<Message>,
    alternative: Option<Message>,
    choice: Choice,
) -> (Message, Source) {
    match (choice, primary, alternative) {
        (Choice::Primary, Some(primary), _) => (primary, Source::Primary),
        (Choice::Alternative, _, Some(alternative)) => (alternative, Source::Alternative),
        (_, primary, alternative) => {
            let empty = |m: &Message| !has_answers(m);
            primary
                .filter(empty)
                .map(|m| (m, Source::Primary))
                .or_else(|| alternative.filter(empty).map(|m| (m, Source::Alternative)))
                .unwrap_or_else(|| (response_to(request, ResponseCode::ServFail), Source::Failure))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    use hickory_proto::op::Query;
    use hickory_proto::rr::Name;

    use crate::upstream::Protocol;

    fn request(name: &str, qtype: RecordType) -> Message {
        let mut message = Message::new();
        message.set_id(7).set_recursion_desired(true);
        message.add_query(Query::query(Name::from_str(name).unwrap(), qtype));
        message
    }

    fn answer(ip: &str) -> Message {
        address_response(&request("example.com.", RecordType::A), &[ip.parse().unwrap()], 60)
    }

    fn nxdomain() -> Message {
        response_to(&request("example.com.", RecordType::A), ResponseCode::NXDomain)
    }

    #[test]
    fn settle_follows_choice() {
        let req = request("example.com.", RecordType::A);

        let (_, source) = settle(&req, Some(answer("192.0.2.1")), None, Choice::Primary);
        assert_eq!(source, Source::Primary);

        let (_, source) = settle(
            &req,
            Some(answer("192.0.2.1")),
            Some(answer("192.0.2.2")),
            Choice::Alternative,
        );
        assert_eq!(source, Source::Alternative);
    }

    #[test]
    fn settle_passes_on_empty_reply() {
        let req = request("example.com.", RecordType::A);

        let (response, source) = settle(&req, Some(nxdomain()), None, Choice::Neither);
        assert_eq!(source, Source::Primary);
        assert_eq!(response.response_code(), ResponseCode::NXDomain);

        let (_, source) =
            settle(&req, Some(answer("198.51.100.9")), Some(nxdomain()), Choice::Neither);
        assert_eq!(source, Source::Alternative);
    }

    #[test]
    fn settle_without_anything_is_servfail() {
        let req = request("example.com.", RecordType::A);

        let (response, source) = settle(&req, None, None, Choice::Neither);

        assert_eq!(source, Source::Failure);
        assert_eq!(response.response_code(), ResponseCode::ServFail);
        assert_eq!(response.id(), 7);
        assert!(response.answers().is_empty());
    }

    #[test]
    fn fallback_deserializes() {
        #[derive(Deserialize)]
        struct Wrapper {
            fallback: Fallback,
        }

        let w: Wrapper = toml::from_str("fallback = \"alternative\"").unwrap();
        assert_eq!(w.fallback, Fallback::Alternative);
    }

    #[test]
    fn routing_order() {
        let mut config = DispatcherConfig::new(
            Upstream::new("p", "192.0.2.53:53", Protocol::Udp),
            Upstream::new("a", "198.51.100.53:53", Protocol::Udp),
        );
        config.domain_primary = DomainList::parse("both.example\nprimary.example\n");
        config.domain_alternative = DomainList::parse("both.example\nalt.example\n");
        let dispatcher = Dispatcher::new(config, Arc::new(crate::upstream::NetworkClient::new()));

        let route = |name: &str| dispatcher.route(&Question::new(name, RecordType::A));
        assert_eq!(route("www.primary.example"), Route::Primary);
        assert_eq!(route("both.example"), Route::Primary);
        assert_eq!(route("alt.example"), Route::Alternative);
        assert_eq!(route("other.example"), Route::Race);
    }
}
