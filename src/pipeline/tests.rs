//! Pipeline Module Tests
//!
//! ## Test Scopes
//! - **Counting**: Word splitting edge cases.
//! - **Aggregation**: Merge laws, finalization, non-idempotent merge vs unit-id dedupe.
//! - **Roles**: Worker, aggregator and dispatcher driven over the in-process broker.

#[cfg(test)]
mod tests {
    use crate::broker::queue::{Broker, DEFAULT_LEASE};
    use crate::broker::transport::{Consumer, Transport};
    use crate::broker::types::*;
    use crate::config::PipelineConfig;
    use crate::error::TransportError;
    use crate::pipeline::aggregator::{AggregatorService, MergeAggregator, MergeOutcome, run_aggregator};
    use crate::pipeline::dispatcher::Dispatcher;
    use crate::pipeline::local::run_local;
    use crate::pipeline::types::{FinalHistogram, PartialCount, unit_id};
    use crate::pipeline::worker::{CountingWorker, count_words, run_worker_pool};
    use crate::segmenter::scanner::segment;
    use crate::segmenter::types::{DelimiterPolicy, SENTINEL};

    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.broker.poll_ms = 20;
        config
    }

    fn partial_json(pairs: &[(&str, u64)]) -> Vec<u8> {
        let map: BTreeMap<String, u64> = pairs.iter().map(|(w, c)| (w.to_string(), *c)).collect();
        serde_json::to_vec(&map).unwrap()
    }

    fn finalized(outcome: MergeOutcome) -> FinalHistogram {
        match outcome {
            MergeOutcome::Finalized(histogram) => histogram,
            other => panic!("expected a finalized run, got {:?}", other),
        }
    }

    // ============================================================
    // TEST 1: count_words
    // ============================================================

    #[test]
    fn test_count_words_line() {
        assert_eq!(
            count_words("hello world hello"),
            PartialCount::from([("hello", 2), ("world", 1)])
        );
    }

    #[test]
    fn test_count_words_empty_unit_is_empty() {
        assert!(count_words("").is_empty());
    }

    #[test]
    fn test_count_words_keeps_empty_tokens() {
        // Adjacent spaces produce an empty token
        assert_eq!(
            count_words("a  b"),
            PartialCount::from([("a", 1), ("", 1), ("b", 1)])
        );
        assert_eq!(count_words(" "), PartialCount::from([("", 2)]));
    }

    #[test]
    fn test_count_words_sentinel_verbatim() {
        let counts = count_words(SENTINEL);

        assert!(counts.contains_sentinel());
        assert_eq!(counts.get(SENTINEL), 1);
    }

    #[test]
    fn test_partial_count_wire_format() {
        let counts = count_words("hello world");

        assert_eq!(counts.to_bytes().unwrap(), br#"{"hello":1,"world":1}"#.to_vec());
        assert_eq!(PartialCount::from_bytes(br#"{"x":3}"#).unwrap().get("x"), 3);
    }

    // ============================================================
    // TEST 2: MergeAggregator
    // ============================================================

    #[test]
    fn test_sample_document_end_to_end_without_transport() {
        let seg = segment(
            ["Title: Sample", "I", "hello world", "hello", "FIM"],
            DelimiterPolicy::default(),
        );

        let mut aggregator = MergeAggregator::new();
        let mut outcomes: Vec<MergeOutcome> = seg
            .units
            .iter()
            .map(|unit| aggregator.merge(&count_words(unit.as_str())))
            .collect();

        let last = outcomes.pop().unwrap();
        assert!(outcomes.iter().all(|o| *o == MergeOutcome::Accumulated));
        assert_eq!(
            finalized(last),
            FinalHistogram(BTreeMap::from([("hello".into(), 2), ("world".into(), 1)]))
        );
        assert!(aggregator.running_total().is_empty());
    }

    #[test]
    fn test_finalize_strips_sentinel_and_empty_word() {
        let mut aggregator = MergeAggregator::new();
        aggregator.merge(&PartialCount::from([("a", 1), ("", 3)]));

        let histogram = finalized(aggregator.merge(&PartialCount::from([(SENTINEL, 1)])));

        assert_eq!(histogram.get("a"), 1);
        assert_eq!(histogram.len(), 1);
        assert_eq!(histogram.get(""), 0);
        assert_eq!(histogram.get(SENTINEL), 0);
    }

    #[test]
    fn test_merge_is_not_idempotent() {
        let partial = PartialCount::from([("hello", 1)]);
        let mut once = MergeAggregator::new();
        let mut twice = MergeAggregator::new();

        once.merge(&partial);
        twice.merge(&partial);
        twice.merge(&partial);

        let sentinel = PartialCount::from([(SENTINEL, 1)]);
        let a = finalized(once.merge(&sentinel));
        let b = finalized(twice.merge(&sentinel));
        assert_ne!(a, b);
        assert_eq!(b.get("hello"), 2);
    }

    #[test]
    fn test_merge_unit_skips_redelivery() {
        let partial = PartialCount::from([("hello", 1)]);
        let mut aggregator = MergeAggregator::new();

        assert_eq!(aggregator.merge_unit("r:0", &partial), MergeOutcome::Accumulated);
        assert_eq!(aggregator.merge_unit("r:0", &partial), MergeOutcome::Duplicate);

        let histogram =
            finalized(aggregator.merge_unit("r:1", &PartialCount::from([(SENTINEL, 1)])));
        assert_eq!(histogram.get("hello"), 1);

        // The record is per run
        assert_eq!(aggregator.merge_unit("r:0", &partial), MergeOutcome::Accumulated);
    }

    #[test]
    fn test_each_sentinel_finalizes_once() {
        let mut aggregator = MergeAggregator::new();
        let sentinel = PartialCount::from([(SENTINEL, 1)]);

        aggregator.merge(&PartialCount::from([("a", 1)]));
        let first = finalized(aggregator.merge(&sentinel));
        aggregator.merge(&PartialCount::from([("b", 1)]));
        let second = finalized(aggregator.merge(&sentinel));
        let third = finalized(aggregator.merge(&sentinel));

        assert_eq!(first.get("a"), 1);
        assert_eq!(second.get("b"), 1);
        assert_eq!(second.get("a"), 0);
        assert!(third.is_empty());
    }

    #[test]
    fn test_reset_discards_running_total() {
        let mut aggregator = MergeAggregator::new();
        aggregator.merge_unit("r:0", &PartialCount::from([("a", 1)]));

        aggregator.reset();

        assert!(aggregator.running_total().is_empty());
        assert_eq!(
            aggregator.merge_unit("r:0", &PartialCount::from([("a", 1)])),
            MergeOutcome::Accumulated
        );
    }

    #[test]
    fn test_tagged_sentinel_waits_for_overtaken_units() {
        let mut aggregator = MergeAggregator::new();
        let sentinel = PartialCount::from([(SENTINEL, 1)]);

        aggregator.merge_unit("r:0", &PartialCount::from([("a", 1)]));
        assert_eq!(aggregator.merge_unit("r:2", &sentinel), MergeOutcome::Accumulated);

        let histogram =
            finalized(aggregator.merge_unit("r:1", &PartialCount::from([("b", 1)])));
        assert_eq!(histogram.get("a"), 1);
        assert_eq!(histogram.get("b"), 1);
    }

    #[test]
    fn test_skipped_unit_completes_run() {
        let mut aggregator = MergeAggregator::new();

        aggregator.merge_unit("r:0", &PartialCount::from([("a", 1)]));
        aggregator.merge_unit("r:2", &PartialCount::from([(SENTINEL, 1)]));

        let histogram = finalized(aggregator.skip_unit("r:1"));
        assert_eq!(histogram.get("a"), 1);
        assert_eq!(aggregator.skip_unit("x:0"), MergeOutcome::Discarded);
    }

    #[test]
    fn test_untagged_sentinel_finalizes_immediately() {
        let mut aggregator = MergeAggregator::new();
        aggregator.merge_unit("r:0", &PartialCount::from([("a", 1)]));

        let histogram =
            finalized(aggregator.merge_unit("legacy", &PartialCount::from([(SENTINEL, 1)])));

        assert_eq!(histogram.get("a"), 1);
    }

    fn arb_partial() -> impl Strategy<Value = PartialCount> {
        prop::collection::btree_map("[a-z]{0,3}", 1u64..5, 0..6).prop_map(PartialCount)
    }

    fn run_to_histogram(partials: &[PartialCount]) -> FinalHistogram {
        let mut aggregator = MergeAggregator::new();
        for partial in partials {
            aggregator.merge(partial);
        }
        finalized(aggregator.merge(&PartialCount::from([(SENTINEL, 1)])))
    }

    proptest! {
        #[test]
        fn prop_merge_is_order_independent(
            partials in prop::collection::vec(arb_partial(), 0..10),
            seed in any::<u64>(),
        ) {
            let mut shuffled = partials.clone();
            // Deterministic shuffle from the seed
            let len = shuffled.len();
            if len > 1 {
                for i in 0..len {
                    let j = ((seed.wrapping_mul(i as u64 + 1)) % len as u64) as usize;
                    shuffled.swap(i, j);
                }
            }

            prop_assert_eq!(run_to_histogram(&partials), run_to_histogram(&shuffled));
        }

        #[test]
        fn prop_merge_is_associative(
            a in arb_partial(),
            b in arb_partial(),
            c in arb_partial(),
        ) {
            // (a + b) + c against a + (b + c), pre-combined into a single partial
            let mut bc = b.clone();
            for (word, count) in &c.0 {
                *bc.0.entry(word.clone()).or_insert(0) += count;
            }

            let left = run_to_histogram(&[a.clone(), b, c]);
            let right = run_to_histogram(&[a, bc]);
            prop_assert_eq!(left, right);
        }

        #[test]
        fn prop_final_histogram_never_has_sentinel_or_empty(
            lines in prop::collection::vec("[a-z <>EoF]{0,12}", 0..8),
        ) {
            let partials: Vec<PartialCount> = lines.iter().map(|l| count_words(l)).collect();
            let histogram = run_to_histogram(&partials);

            prop_assert!(histogram.0.keys().all(|k| !k.is_empty() && k != SENTINEL));
        }
    }

    // ============================================================
    // TEST 3: Counting worker over the broker
    // ============================================================

    #[tokio::test]
    async fn test_worker_publishes_partial_with_unit_id() {
        let config = test_config();
        let broker: Arc<dyn Transport> = Arc::new(Broker::new(DEFAULT_LEASE));
        let worker = CountingWorker::connect(0, broker.clone(), &config).await.unwrap();

        broker
            .publish(
                &config.queues.task,
                OutboundMessage::new(
                    "hello world",
                    MessageProperties::persistent("text/plain").with_unit_id("run:3"),
                ),
            )
            .await
            .unwrap();

        let counts = worker.process_one().await.unwrap();
        assert_eq!(counts, PartialCount::from([("hello", 1), ("world", 1)]));

        let partials = Consumer::subscribe(broker.clone(), &config.queues.partial, 1, config.poll())
            .await
            .unwrap();
        let d = partials.recv().await.unwrap();
        assert_eq!(d.properties.unit_id.as_deref(), Some("run:3"));
        assert_eq!(d.properties.content_type.as_deref(), Some("application/json"));
        assert_eq!(PartialCount::from_bytes(&d.body).unwrap(), counts);

        // The unit itself was acknowledged
        let stats = broker.stats(&config.queues.task).await.unwrap();
        assert_eq!((stats.ready, stats.unacked), (0, 0));
    }

    #[tokio::test]
    async fn test_worker_decodes_invalid_utf8_lossily() {
        let config = test_config();
        let broker: Arc<dyn Transport> = Arc::new(Broker::new(DEFAULT_LEASE));
        let worker = CountingWorker::connect(0, broker.clone(), &config).await.unwrap();

        broker
            .publish(
                &config.queues.task,
                OutboundMessage::new(
                    b"ok \xff".to_vec(),
                    MessageProperties::persistent("text/plain"),
                ),
            )
            .await
            .unwrap();

        let counts = worker.process_one().await.unwrap();
        assert_eq!(counts.get("ok"), 1);
        assert_eq!(counts.0.len(), 2);
    }

    /// Delegates to a broker but refuses every publish to one queue. With
    /// `lose_acks`, every ack behaves as if the lease had already run out: the
    /// message goes back to the queue and the ack is refused.
    struct RefusingTransport {
        inner: Broker,
        refused_queue: String,
        lose_acks: bool,
    }

    impl RefusingTransport {
        fn refusing(queue: &str) -> Self {
            Self {
                inner: Broker::new(DEFAULT_LEASE),
                refused_queue: queue.to_string(),
                lose_acks: false,
            }
        }
    }

    #[async_trait]
    impl Transport for RefusingTransport {
        async fn declare_queue(
            &self,
            queue: &str,
            options: QueueOptions,
        ) -> Result<(), TransportError> {
            self.inner.declare_queue(queue, options).await
        }

        async fn publish(
            &self,
            queue: &str,
            message: OutboundMessage,
        ) -> Result<MessageId, TransportError> {
            if queue == self.refused_queue {
                return Err(TransportError::Timeout(queue.to_string()));
            }
            self.inner.publish(queue, message).await
        }

        async fn consume(
            &self,
            queue: &str,
            prefetch: usize,
        ) -> Result<ConsumerTag, TransportError> {
            self.inner.consume(queue, prefetch).await
        }

        async fn fetch(
            &self,
            consumer: &ConsumerTag,
            wait: Duration,
        ) -> Result<Option<Delivery>, TransportError> {
            self.inner.fetch(consumer, wait).await
        }

        async fn ack(
            &self,
            consumer: &ConsumerTag,
            delivery_tag: &MessageId,
        ) -> Result<(), TransportError> {
            if self.lose_acks {
                self.inner.nack(consumer, delivery_tag, true).await?;
                return Err(TransportError::UnknownDelivery {
                    consumer: consumer.0.clone(),
                    delivery_tag: delivery_tag.0.clone(),
                });
            }
            self.inner.ack(consumer, delivery_tag).await
        }

        async fn nack(
            &self,
            consumer: &ConsumerTag,
            delivery_tag: &MessageId,
            requeue: bool,
        ) -> Result<(), TransportError> {
            self.inner.nack(consumer, delivery_tag, requeue).await
        }

        async fn cancel(&self, consumer: &ConsumerTag) -> Result<(), TransportError> {
            self.inner.cancel(consumer).await
        }

        async fn stats(&self, queue: &str) -> Result<QueueStats, TransportError> {
            self.inner.stats(queue).await
        }
    }

    #[tokio::test]
    async fn test_worker_requeues_unit_when_publish_fails() {
        let config = test_config();
        let transport = Arc::new(RefusingTransport::refusing(&config.queues.partial));
        let worker = CountingWorker::connect(0, transport.clone(), &config)
            .await
            .unwrap();

        transport
            .publish(
                &config.queues.task,
                OutboundMessage::new("hello", MessageProperties::persistent("text/plain")),
            )
            .await
            .unwrap();

        let err = worker.process_one().await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));

        let stats = transport.stats(&config.queues.task).await.unwrap();
        assert_eq!((stats.ready, stats.unacked), (1, 0));
    }

    #[tokio::test]
    async fn test_worker_keeps_going_after_losing_a_lease() {
        let config = test_config();
        let transport = Arc::new(RefusingTransport {
            lose_acks: true,
            ..RefusingTransport::refusing("nothing")
        });
        let worker = CountingWorker::connect(0, transport.clone(), &config)
            .await
            .unwrap();

        transport
            .publish(
                &config.queues.task,
                OutboundMessage::new(
                    "first unit",
                    MessageProperties::persistent("text/plain").with_unit_id("run:0"),
                ),
            )
            .await
            .unwrap();

        // Counted, lease lost, handed out again and counted again
        assert_eq!(worker.process_one().await.unwrap().get("first"), 1);
        assert_eq!(worker.process_one().await.unwrap().get("first"), 1);
        assert_eq!(transport.stats(&config.queues.partial).await.unwrap().ready, 2);
    }

    // ============================================================
    // TEST 4: Aggregator service over the broker
    // ============================================================

    async fn publish_partial(broker: &Arc<dyn Transport>, queue: &str, body: Vec<u8>, unit: &str) {
        broker
            .publish(
                queue,
                OutboundMessage::new(
                    body,
                    MessageProperties::persistent("application/json").with_unit_id(unit),
                ),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_aggregator_service_publishes_final_histogram() {
        let config = test_config();
        let broker: Arc<dyn Transport> = Arc::new(Broker::new(DEFAULT_LEASE));
        let mut service = AggregatorService::connect(broker.clone(), &config)
            .await
            .unwrap();
        let partial_queue = config.queues.partial.as_str();

        publish_partial(&broker, partial_queue, partial_json(&[("hello", 1), ("world", 1)]), "r:0").await;
        publish_partial(&broker, partial_queue, b"not json".to_vec(), "r:1").await;
        // Redelivered copy of r:0
        publish_partial(&broker, partial_queue, partial_json(&[("hello", 1), ("world", 1)]), "r:0").await;
        publish_partial(&broker, partial_queue, partial_json(&[("hello", 1)]), "r:2").await;
        publish_partial(&broker, partial_queue, partial_json(&[(SENTINEL, 1)]), "r:3").await;

        assert_eq!(service.process_one().await.unwrap(), MergeOutcome::Accumulated);
        assert_eq!(service.process_one().await.unwrap(), MergeOutcome::Discarded);
        assert_eq!(service.process_one().await.unwrap(), MergeOutcome::Duplicate);
        assert_eq!(service.process_one().await.unwrap(), MergeOutcome::Accumulated);
        let histogram = finalized(service.process_one().await.unwrap());
        assert!(service.aggregator().running_total().is_empty());

        let responses = Consumer::subscribe(broker.clone(), &config.queues.response, 1, config.poll())
            .await
            .unwrap();
        let d = responses.recv().await.unwrap();
        assert_eq!(d.properties.run_id.as_deref(), Some("r"));
        let body = String::from_utf8(d.body.clone()).unwrap();
        assert!(body.contains('\n'), "response is pretty-printed");
        assert_eq!(FinalHistogram::from_bytes(&d.body).unwrap(), histogram);
        assert_eq!(histogram.get("hello"), 2);
        assert_eq!(histogram.get("world"), 1);

        let stats = broker.stats(partial_queue).await.unwrap();
        assert_eq!((stats.ready, stats.unacked), (0, 0));
    }

    #[tokio::test]
    async fn test_aggregator_without_dedupe_double_counts() {
        let mut config = test_config();
        config.aggregator.dedupe_redeliveries = false;
        let broker: Arc<dyn Transport> = Arc::new(Broker::new(DEFAULT_LEASE));
        let mut service = AggregatorService::connect(broker.clone(), &config)
            .await
            .unwrap();
        let partial_queue = config.queues.partial.as_str();

        publish_partial(&broker, partial_queue, partial_json(&[("hello", 1)]), "r:0").await;
        publish_partial(&broker, partial_queue, partial_json(&[("hello", 1)]), "r:0").await;
        publish_partial(&broker, partial_queue, partial_json(&[(SENTINEL, 1)]), "r:1").await;

        service.process_one().await.unwrap();
        service.process_one().await.unwrap();
        let histogram = finalized(service.process_one().await.unwrap());

        assert_eq!(histogram.get("hello"), 2);
    }

    // ============================================================
    // TEST 5: Dispatcher
    // ============================================================

    #[tokio::test]
    async fn test_dispatcher_publishes_tagged_units_and_times_out() {
        let mut config = test_config();
        config.dispatcher.response_timeout_secs = Some(1);
        let broker: Arc<dyn Transport> = Arc::new(Broker::new(DEFAULT_LEASE));
        let dispatcher = Dispatcher::new(broker.clone(), &config);
        let seg = segment(
            ["Title: T", "I", "a b", "c", "FIM"],
            DelimiterPolicy::default(),
        );

        // Nobody answers
        let err = dispatcher.dispatch(&seg).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));

        let tasks = Consumer::subscribe(broker.clone(), &config.queues.task, 10, config.poll())
            .await
            .unwrap();
        let mut units = Vec::new();
        let mut run_ids = Vec::new();
        for seq in 0..3 {
            let d = tasks.recv().await.unwrap();
            let id = d.properties.unit_id.clone().unwrap();
            let (run, n) = id.rsplit_once(':').unwrap();
            assert_eq!(n, seq.to_string());
            assert_eq!(id, unit_id(run, seq));
            run_ids.push(run.to_string());
            assert!(d.properties.persistent);
            units.push(String::from_utf8(d.body).unwrap());
        }
        assert_eq!(units, vec!["a b", "c", SENTINEL]);
        assert!(run_ids.windows(2).all(|w| w[0] == w[1]));

        // The response consumer was cancelled
        let stats = broker.stats(&config.queues.response).await.unwrap();
        assert_eq!(stats.consumers, 0);
    }

    #[tokio::test]
    async fn test_dispatcher_drops_responses_of_other_runs() {
        let mut config = test_config();
        config.worker.count = 2;
        config.dispatcher.response_timeout_secs = Some(10);
        let broker: Arc<dyn Transport> = Arc::new(Broker::new(DEFAULT_LEASE));

        broker
            .declare_queue(&config.queues.response, QueueOptions::durable())
            .await
            .unwrap();
        let stale = [
            MessageProperties::persistent("application/json").with_run_id("earlier-run"),
            MessageProperties::persistent("application/json"),
        ];
        for properties in stale {
            broker
                .publish(
                    &config.queues.response,
                    OutboundMessage::new(r#"{"stale": 9}"#, properties),
                )
                .await
                .unwrap();
        }

        let roles = {
            let (worker_transport, worker_config) = (broker.clone(), config.clone());
            let (aggregator_transport, aggregator_config) = (broker.clone(), config.clone());
            [
                tokio::spawn(async move {
                    let _ = run_worker_pool(worker_transport, &worker_config).await;
                }),
                tokio::spawn(async move {
                    let _ = run_aggregator(aggregator_transport, &aggregator_config).await;
                }),
            ]
        };

        let seg = segment(["Title: T", "I", "a b", "b", "FIM"], DelimiterPolicy::default());
        let histogram = Dispatcher::new(broker.clone(), &config)
            .dispatch(&seg)
            .await
            .unwrap();
        for role in roles {
            role.abort();
        }

        assert_eq!(histogram.get("stale"), 0);
        assert_eq!((histogram.get("a"), histogram.get("b")), (1, 2));
        let stats = broker.stats(&config.queues.response).await.unwrap();
        assert_eq!((stats.ready, stats.unacked), (0, 0));
    }

    // ============================================================
    // TEST 6: All roles in one process
    // ============================================================

    fn local_run_setup(dir: &std::path::Path) -> (PipelineConfig, String) {
        let book = dir.join("book.txt");
        std::fs::write(&book, "Title: Local\nI\none two two\nFIM\n").unwrap();

        let mut config = test_config();
        config.worker.count = 2;
        config.dispatcher.output_dir = dir.join("out");
        (config, book.to_string_lossy().into_owned())
    }

    #[tokio::test]
    async fn test_run_local_completes_a_run() {
        let dir = tempfile::tempdir().unwrap();
        let (config, book) = local_run_setup(dir.path());
        let transport: Arc<dyn Transport> = Arc::new(Broker::new(DEFAULT_LEASE));

        let report = run_local(transport, &config, &book).await.unwrap();

        assert_eq!(report.title, "Local");
        assert_eq!(report.units, 1);
        assert_eq!(report.histogram.get("two"), 2);
        assert!(report.output_path.exists());
    }

    #[tokio::test]
    async fn test_run_local_fails_when_a_role_stops() {
        let dir = tempfile::tempdir().unwrap();
        let (config, book) = local_run_setup(dir.path());
        let transport = Arc::new(RefusingTransport::refusing(&config.queues.response));

        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            run_local(transport, &config, &book),
        )
        .await
        .expect("a stopped role must end the run");

        let err = outcome.unwrap_err();
        assert!(format!("{:#}", err).contains("aggregator stopped"), "{:#}", err);
        assert!(!config.dispatcher.output_dir.join("wfc-Local.txt").exists());
    }
}
