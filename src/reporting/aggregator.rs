//! # Aggregator
//!
//! Folds job results and enrichment results into the cycle report.
//!
//! Location summaries are produced the moment a job result is ingested, so they
//! can be streamed out. The network summary needs every enrichment result and is
//! only built by [`Aggregator::finalize`].

use chrono::Utc;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

use crate::domain::{
    EnrichmentResult, FlaggedItem, JobErrorKind, JobResult, LocationContribution, LocationSummary,
    NetworkItem, NetworkSummary,
};
use crate::infrastructure::config::ReportingConfig;

/// Occurrences of one identifier across locations
#[derive(Debug, Clone, Default)]
pub struct ItemTally {
    pub identifier: String,
    pub name: Option<String>,
    pub by_location: HashMap<String, u64>,
}

impl ItemTally {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.by_location.values().sum()
    }
}

/// A location whose job ended in failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedLocation {
    pub location_id: String,
    pub location_name: String,
    pub message: String,
    pub attempts: u32,
}

/// A location summary with the enrichment of its top items attached
#[derive(Debug, Clone, Serialize)]
pub struct LocationReport {
    pub summary: LocationSummary,
    pub enrichment: Vec<EnrichmentResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateReport {
    /// Sorted by location id
    pub locations: Vec<LocationReport>,
    pub network: NetworkSummary,
    /// Highest item-not-found rate first
    pub worst_locations: Vec<LocationSummary>,
    /// Highest late-order rate first
    pub most_late_locations: Vec<LocationSummary>,
    /// Lowest units per hour first
    pub lowest_uph_locations: Vec<LocationSummary>,
    pub failures: BTreeMap<JobErrorKind, Vec<FailedLocation>>,
    /// Cut short by cancellation or a systemic abort, not failed on their own
    pub interrupted: Vec<FailedLocation>,
    pub enrichment_complete: usize,
    pub enrichment_partial: usize,
}

impl AggregateReport {
    #[must_use]
    pub fn failed_locations(&self) -> usize {
        self.failures.values().map(Vec::len).sum()
    }
}

pub struct Aggregator {
    config: ReportingConfig,
    ingested_jobs: HashSet<String>,
    summaries: BTreeMap<String, LocationSummary>,
    tallies: HashMap<String, ItemTally>,
    enrichment: HashMap<String, EnrichmentResult>,
    failures: BTreeMap<JobErrorKind, Vec<FailedLocation>>,
    interrupted: Vec<FailedLocation>,
}

impl Aggregator {
    #[must_use]
    pub fn new(config: ReportingConfig) -> Self {
        Self {
            config,
            ingested_jobs: HashSet::new(),
            summaries: BTreeMap::new(),
            tallies: HashMap::new(),
            enrichment: HashMap::new(),
            failures: BTreeMap::new(),
            interrupted: Vec::new(),
        }
    }

    /// Records a terminal job result.
    ///
    /// Returns the location summary for a succeeded job. A location already
    /// ingested this cycle is ignored.
    pub fn ingest_job(&mut self, result: &JobResult) -> Option<LocationSummary> {
        let job = &result.job;
        if !self.ingested_jobs.insert(job.spec.location_id.clone()) {
            debug!(location_id = %job.spec.location_id, "Duplicate job result ignored");
            return None;
        }

        let Some(collected) = job.result.as_ref().filter(|_| result.is_success()) else {
            let failed = FailedLocation {
                location_id: job.spec.location_id.clone(),
                location_name: job.spec.location_name.clone(),
                message: job
                    .last_error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_default(),
                attempts: job.attempt_count,
            };
            if job.was_interrupted() {
                self.interrupted.push(failed);
            } else {
                let kind = job.error_kind().unwrap_or(JobErrorKind::Unknown);
                self.failures.entry(kind).or_default().push(failed);
            }
            return None;
        };

        for item in &collected.flagged_items {
            let tally = self
                .tallies
                .entry(item.identifier.clone())
                .or_insert_with(|| ItemTally {
                    identifier: item.identifier.clone(),
                    ..ItemTally::default()
                });
            if tally.name.is_none() {
                tally.name.clone_from(&item.name);
            }
            *tally.by_location.entry(job.spec.location_id.clone()).or_insert(0) +=
                u64::from(item.count);
        }

        let summary = LocationSummary {
            location_id: job.spec.location_id.clone(),
            location_name: job.spec.location_name.clone(),
            metrics: collected.metrics.clone(),
            top_items: top_items(&collected.flagged_items, self.config.items_per_location),
            attempts: job.attempt_count,
        };
        self.summaries
            .insert(summary.location_id.clone(), summary.clone());
        Some(summary)
    }

    /// Records an enrichment result; the first result per identifier is kept.
    pub fn ingest_enrichment(&mut self, result: EnrichmentResult) {
        self.enrichment
            .entry(result.identifier.clone())
            .or_insert(result);
    }

    #[must_use]
    pub fn finalize(self) -> AggregateReport {
        let tallies: Vec<ItemTally> = self.tallies.into_values().collect();
        let mut items = rank_network(
            &tallies,
            self.config.network_top_n,
            self.config.contributors_per_item,
        );
        for item in &mut items {
            item.enrichment = self.enrichment.get(&item.identifier).cloned();
        }

        let contributing: HashSet<&str> = tallies
            .iter()
            .flat_map(|t| t.by_location.keys().map(String::as_str))
            .collect();
        let network = NetworkSummary {
            items,
            distinct_items: tallies.len(),
            total_occurrences: tallies.iter().map(ItemTally::total).sum(),
            location_count: contributing.len(),
            generated_at: Utc::now(),
        };

        // Locations that shopped no orders have no meaningful rates
        let active: Vec<&LocationSummary> = self
            .summaries
            .values()
            .filter(|s| s.metrics.orders_shopped > 0)
            .collect();
        let limit = self.config.worst_location_count;
        let worst = highlight(&active, limit, |a, b| {
            b.metrics
                .item_not_found_rate
                .total_cmp(&a.metrics.item_not_found_rate)
        });
        let most_late = highlight(&active, limit, |a, b| {
            b.metrics
                .late_order_rate()
                .total_cmp(&a.metrics.late_order_rate())
        });
        let lowest_uph = highlight(&active, limit, |a, b| {
            a.metrics
                .average_units_per_hour
                .total_cmp(&b.metrics.average_units_per_hour)
        });

        let locations: Vec<LocationReport> = self
            .summaries
            .into_values()
            .map(|summary| {
                let enrichment = summary
                    .top_items
                    .iter()
                    .filter_map(|item| self.enrichment.get(&item.identifier).cloned())
                    .collect();
                LocationReport {
                    summary,
                    enrichment,
                }
            })
            .collect();

        let enrichment_complete = self.enrichment.values().filter(|r| r.is_complete()).count();
        let report = AggregateReport {
            locations,
            network,
            worst_locations: worst,
            most_late_locations: most_late,
            lowest_uph_locations: lowest_uph,
            failures: self.failures,
            interrupted: self.interrupted,
            enrichment_complete,
            enrichment_partial: self.enrichment.len() - enrichment_complete,
        };
        info!(
            "📊 Aggregated {} locations, {} failed, {} distinct flagged items",
            report.locations.len(),
            report.failed_locations(),
            report.network.distinct_items
        );
        report
    }
}

/// First `limit` locations under `order`, ties by location id ascending.
fn highlight(
    active: &[&LocationSummary],
    limit: usize,
    order: impl Fn(&LocationSummary, &LocationSummary) -> Ordering,
) -> Vec<LocationSummary> {
    let mut ranked = active.to_vec();
    ranked.sort_by(|a, b| order(a, b).then_with(|| a.location_id.cmp(&b.location_id)));
    ranked.into_iter().take(limit).cloned().collect()
}

/// Most frequent items at one location: count descending, identifier ascending.
fn top_items(items: &[FlaggedItem], limit: usize) -> Vec<FlaggedItem> {
    let mut sorted = items.to_vec();
    sorted.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.identifier.cmp(&b.identifier))
    });
    sorted.truncate(limit);
    sorted
}

/// Ranks identifiers by total occurrences across locations.
///
/// Totals descend with ties broken by identifier ascending; the first `top_n` are
/// kept, each with its `per_item` largest contributing locations (count
/// descending, location id ascending).
#[must_use]
pub fn rank_network(tallies: &[ItemTally], top_n: usize, per_item: usize) -> Vec<NetworkItem> {
    let mut ranked: Vec<(u64, &ItemTally)> = tallies.iter().map(|t| (t.total(), t)).collect();
    ranked.sort_by(|(a_total, a), (b_total, b)| {
        b_total
            .cmp(a_total)
            .then_with(|| a.identifier.cmp(&b.identifier))
    });
    ranked.truncate(top_n);

    ranked
        .into_iter()
        .map(|(total_count, tally)| {
            let mut contributors: Vec<LocationContribution> = tally
                .by_location
                .iter()
                .map(|(location_id, count)| LocationContribution {
                    location_id: location_id.clone(),
                    count: *count,
                })
                .collect();
            contributors.sort_by(|a, b| {
                b.count
                    .cmp(&a.count)
                    .then_with(|| a.location_id.cmp(&b.location_id))
            });
            contributors.truncate(per_item);

            NetworkItem {
                identifier: tally.identifier.clone(),
                name: tally.name.clone(),
                total_count,
                location_count: tally.by_location.len(),
                contributors,
                enrichment: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        AuthMode, CollectedLocation, CollectionError, Job, LocationJob, LocationMetrics,
        ResolvedVia, SubLookup,
    };
    use std::time::Duration;

    fn tally(identifier: &str, counts: &[(&str, u64)]) -> ItemTally {
        ItemTally {
            identifier: identifier.to_string(),
            name: None,
            by_location: counts
                .iter()
                .map(|(location, count)| ((*location).to_string(), *count))
                .collect(),
        }
    }

    fn succeeded(id: &str, inf_rate: f64, items: Vec<FlaggedItem>) -> JobResult {
        with_metrics(
            id,
            LocationMetrics {
                orders_shopped: 10,
                item_not_found_rate: inf_rate,
                ..LocationMetrics::default()
            },
            items,
        )
    }

    fn with_metrics(id: &str, metrics: LocationMetrics, items: Vec<FlaggedItem>) -> JobResult {
        let mut job = Job::new(LocationJob::new(id, format!("Store {id}"), id));
        job.begin_attempt();
        job.succeed(CollectedLocation {
            metrics,
            flagged_items: items,
        });
        JobResult {
            job,
            elapsed: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_ranking_keeps_top_three_contributors() {
        let tallies = vec![
            tally("B", &[("X", 9)]),
            tally("A", &[("X", 10), ("Y", 4), ("Z", 3), ("W", 5)]),
        ];
        let ranked = rank_network(&tallies, 10, 3);

        assert_eq!(ranked[0].identifier, "A");
        assert_eq!(ranked[0].total_count, 22);
        assert_eq!(ranked[0].location_count, 4);
        assert_eq!(ranked[0].contributors.len(), 3);
        assert_eq!(ranked[1].identifier, "B");
        let contributors: Vec<(&str, u64)> = ranked[0]
            .contributors
            .iter()
            .map(|c| (c.location_id.as_str(), c.count))
            .collect();
        assert_eq!(contributors, vec![("X", 10), ("W", 5), ("Y", 4)]);
    }

    #[test]
    fn test_ranking_ties_break_on_identifier() {
        let tallies = vec![
            tally("200", &[("S2", 2), ("S1", 2)]),
            tally("100", &[("S3", 4)]),
            tally("300", &[("S1", 1)]),
        ];
        let ranked = rank_network(&tallies, 2, 3);

        let ids: Vec<&str> = ranked.iter().map(|i| i.identifier.as_str()).collect();
        assert_eq!(ids, vec!["100", "200"]);
        assert_eq!(ranked[1].contributors[0].location_id, "S1");
    }

    #[test]
    fn test_job_results_feed_summaries_and_network() {
        let mut aggregator = Aggregator::new(ReportingConfig::default());

        let summary = aggregator
            .ingest_job(&succeeded(
                "S1",
                2.5,
                vec![
                    FlaggedItem::new("A", 3, "S1").with_name("Milk"),
                    FlaggedItem::new("B", 5, "S1"),
                ],
            ))
            .unwrap();
        assert_eq!(summary.top_items[0].identifier, "B");

        aggregator.ingest_job(&succeeded("S2", 4.0, vec![FlaggedItem::new("A", 4, "S2")]));
        // Same location again is ignored
        assert!(aggregator.ingest_job(&succeeded("S2", 9.0, vec![])).is_none());

        let mut failed = Job::new(LocationJob::new("S3", "Store S3", "S3"));
        failed.begin_attempt();
        failed.fail(CollectionError::no_data("no metrics published"));
        aggregator.ingest_job(&JobResult {
            job: failed,
            elapsed: Duration::from_secs(1),
        });

        aggregator.ingest_enrichment(EnrichmentResult {
            identifier: "A".into(),
            resolved_identifier: Some("A".into()),
            lookup_location: "S1".into(),
            product: SubLookup::Found(Default::default()),
            stock: SubLookup::NotFound,
            location: SubLookup::Failed("HTTP 503".into()),
            resolved_via: ResolvedVia::Primary,
            auth_mode: AuthMode::None,
        });

        let report = aggregator.finalize();
        assert_eq!(report.network.items[0].identifier, "A");
        assert_eq!(report.network.items[0].total_count, 7);
        assert_eq!(report.network.items[0].name.as_deref(), Some("Milk"));
        assert!(report.network.items[0].enrichment.is_some());
        assert_eq!(report.network.total_occurrences, 12);
        assert_eq!(report.network.location_count, 2);
        assert_eq!(report.worst_locations[0].location_id, "S2");
        assert_eq!(report.failures[&JobErrorKind::NoData][0].location_id, "S3");
        assert_eq!(report.locations.len(), 2);
        assert_eq!(report.locations[0].enrichment.len(), 1);
        assert_eq!(report.enrichment_complete, 1);
    }

    #[test]
    fn test_interrupted_jobs_are_listed_apart_from_failures() {
        let mut aggregator = Aggregator::new(ReportingConfig::default());
        for (id, error) in [
            ("S1", CollectionError::interrupted()),
            ("S2", CollectionError::navigation_failed("HTTP 502")),
        ] {
            let mut job = Job::new(LocationJob::new(id, format!("Store {id}"), id));
            job.begin_attempt();
            job.fail(error);
            aggregator.ingest_job(&JobResult {
                job,
                elapsed: Duration::from_secs(1),
            });
        }

        let report = aggregator.finalize();
        assert_eq!(report.interrupted.len(), 1);
        assert_eq!(report.interrupted[0].location_id, "S1");
        assert_eq!(report.failed_locations(), 1);
        assert_eq!(report.failures[&JobErrorKind::NavigationFailed][0].location_id, "S2");
    }

    #[test]
    fn test_highlights_skip_locations_without_orders() {
        let mut aggregator = Aggregator::new(ReportingConfig {
            worst_location_count: 2,
            ..ReportingConfig::default()
        });
        let stores = [
            ("S1", 20, 1, 95.0, 1.0),
            ("S2", 10, 3, 120.0, 6.0),
            ("S3", 40, 2, 80.0, 2.0),
            // Closed all day: worst numbers on paper, excluded from every highlight
            ("S4", 0, 9, 0.0, 50.0),
        ];
        for (id, orders, lates, uph, inf) in stores {
            aggregator.ingest_job(&with_metrics(
                id,
                LocationMetrics {
                    orders_shopped: orders,
                    late_orders: lates,
                    average_units_per_hour: uph,
                    item_not_found_rate: inf,
                    ..LocationMetrics::default()
                },
                vec![],
            ));
        }

        let report = aggregator.finalize();
        let ids = |list: &[LocationSummary]| -> Vec<String> {
            list.iter().map(|s| s.location_id.clone()).collect()
        };
        // Late rates: S1 5%, S2 30%, S3 5%
        assert_eq!(ids(&report.most_late_locations), vec!["S2", "S1"]);
        assert_eq!(ids(&report.lowest_uph_locations), vec!["S3", "S1"]);
        assert_eq!(ids(&report.worst_locations), vec!["S2", "S3"]);
        assert_eq!(report.locations.len(), 4);
    }
}
