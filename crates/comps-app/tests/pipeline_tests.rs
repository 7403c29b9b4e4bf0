// End-to-end pipeline runs against in-memory leaderboards and an in-memory
// store.

use std::error::Error as _;
use std::path::Path;

use comps_app::persist::PersistError;
use comps_app::pipeline::{run, PipelineError};
use comps_baseball::aggregate::AggregationError;
use comps_baseball::merge::MergeError;
use comps_baseball::savant::StaticSource;
use comps_baseball::table::ExclusionReason;
use comps_core::config::{parse_config, Config};
use comps_core::db::PlayerStore;
use comps_core::Season;

const HEADER: &str = "\"last_name, first_name\",player_id,attempts,avg_hit_speed,brl_percent";

fn config(seasons: &str, clusters: usize) -> Config {
    let text = format!(
        r#"
[pipeline]
seasons = {seasons}
cluster_count = {clusters}
seed = 42

[[metrics]]
key = "avg_hit_speed"
field = "exit_velocity"

[[metrics]]
key = "brl_percent"
field = "brl_percent"

[source]
kind = "csv_dir"
dir = "unused"

[store]
path = ":memory:"
table = "players"
"#
    );
    parse_config(&text, Path::new("pipeline.toml")).unwrap()
}

fn season(year: u16) -> Season {
    Season::from_configured(year).unwrap()
}

fn csv(rows: &[&str]) -> String {
    std::iter::once(HEADER)
        .chain(rows.iter().copied())
        .collect::<Vec<_>>()
        .join("\n")
}

fn store(config: &Config) -> PlayerStore {
    PlayerStore::open(":memory:", &config.store.table, &config.metric_fields()).unwrap()
}

fn dec(record: &comps_core::db::PersistedPlayerRecord, field: &str) -> String {
    record.metrics[field].to_string()
}

#[tokio::test]
async fn two_players_land_in_distinct_groups() {
    let config = config("[21, 22]", 2);
    let source = StaticSource::new()
        .with_season(
            season(2021),
            csv(&[
                "\"Judge, Aaron\",592450,300,95.0,20.0",
                "\"Arraez, Luis\",650333,400,84.0,1.0",
            ]),
        )
        .with_season(
            season(2022),
            csv(&[
                "\"Judge, Aaron\",592450,100,99.0,28.0",
                "\"Arraez, Luis\",650333,200,87.0,2.5",
            ]),
        );
    let store = store(&config);

    let report = run(&config, &source, &store).await.unwrap();
    assert_eq!(report.rows_written, 2);
    assert_eq!(report.cluster_sizes, vec![1, 1]);

    let judge = store.get("592450").unwrap().unwrap();
    assert_eq!(judge.first_name, "Aaron");
    assert_eq!(judge.last_name, "Judge");
    // (95*300 + 99*100) / 400 and (20*300 + 28*100) / 400
    assert_eq!(dec(&judge, "exit_velocity"), "96.00");
    assert_eq!(dec(&judge, "brl_percent"), "22.00");

    let arraez = store.get("650333").unwrap().unwrap();
    assert_eq!(arraez.first_name, "Luis");
    assert_eq!(arraez.last_name, "Arraez");
    // (84*400 + 87*200) / 600 and (1*400 + 2.5*200) / 600
    assert_eq!(dec(&arraez, "exit_velocity"), "85.00");
    assert_eq!(dec(&arraez, "brl_percent"), "1.50");

    assert_ne!(judge.cluster, arraez.cluster);
    assert!(store.similar_to("592450", 5).unwrap().unwrap().is_empty());
}

#[tokio::test]
async fn player_missing_a_season_is_not_persisted() {
    let config = config("[2021, 2022]", 2);
    let source = StaticSource::new()
        .with_season(
            season(2021),
            csv(&[
                "\"Judge, Aaron\",592450,300,95.0,20.0",
                "\"Arraez, Luis\",650333,400,84.0,1.0",
                "\"Trout, Mike\",545361,250,93.1,18.2",
            ]),
        )
        .with_season(
            season(2022),
            csv(&[
                "\"Judge, Aaron\",592450,100,99.0,28.0",
                "\"Arraez, Luis\",650333,200,87.0,2.5",
            ]),
        );
    let store = store(&config);

    let report = run(&config, &source, &store).await.unwrap();
    assert_eq!(report.merged_players, 2);
    assert_eq!(store.count().unwrap(), 2);
    assert!(store.get("545361").unwrap().is_none());
}

#[tokio::test]
async fn zero_attempt_player_is_excluded_and_reported() {
    let config = config("[21, 22]", 2);
    let source = StaticSource::new()
        .with_season(
            season(2021),
            csv(&[
                "\"Judge, Aaron\",592450,300,95.0,20.0",
                "\"Bench, Warm\",111111,0,80.0,0.0",
                "\"Arraez, Luis\",650333,400,84.0,1.0",
            ]),
        )
        .with_season(
            season(2022),
            csv(&[
                "\"Judge, Aaron\",592450,100,99.0,28.0",
                "\"Bench, Warm\",111111,0,81.0,0.0",
                "\"Arraez, Luis\",650333,200,87.0,2.5",
            ]),
        );
    let store = store(&config);

    let report = run(&config, &source, &store).await.unwrap();
    assert_eq!(report.merged_players, 3);
    let excluded: Vec<u64> = report.excluded_players.iter().map(|p| p.player_id).collect();
    assert_eq!(excluded, vec![111111]);
    assert_eq!(report.excluded_players[0].reason, ExclusionReason::ZeroAttempts);
    assert_eq!(report.clustered_players, 2);
    assert!(store.get("111111").unwrap().is_none());
}

#[tokio::test]
async fn blank_attempts_fails_the_run_naming_the_player() {
    let config = config("[21, 22]", 2);
    let source = StaticSource::new()
        .with_season(
            season(2021),
            csv(&[
                "\"Judge, Aaron\",592450,300,95.0,20.0",
                "\"Arraez, Luis\",650333,400,84.0,1.0",
                "\"Soto, Juan\",665742,350,92.0,12.0",
            ]),
        )
        .with_season(
            season(2022),
            csv(&[
                "\"Judge, Aaron\",592450,100,99.0,28.0",
                "\"Arraez, Luis\",650333,200,87.0,2.5",
                "\"Soto, Juan\",665742,,94.0,15.0",
            ]),
        );
    let store = store(&config);

    let err = run(&config, &source, &store).await.unwrap_err();
    match &err {
        PipelineError::Aggregation(AggregationError::MissingAttempts {
            player_id,
            display_name,
            season: s,
        }) => {
            assert_eq!(*player_id, 665742);
            assert_eq!(display_name, "Soto, Juan");
            assert_eq!(*s, season(2022));
        }
        other => panic!("expected MissingAttempts, got {other:?}"),
    }
    assert_eq!(store.count().unwrap(), 0);
}

#[tokio::test]
async fn fractional_attempts_fails_the_run() {
    let config = config("[21, 22]", 2);
    let source = StaticSource::new()
        .with_season(
            season(2021),
            csv(&[
                "\"Judge, Aaron\",592450,300,95.0,20.0",
                "\"Arraez, Luis\",650333,400.6,84.0,1.0",
            ]),
        )
        .with_season(
            season(2022),
            csv(&[
                "\"Judge, Aaron\",592450,100,99.0,28.0",
                "\"Arraez, Luis\",650333,200,87.0,2.5",
            ]),
        );
    let store = store(&config);

    let err = run(&config, &source, &store).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Aggregation(AggregationError::MissingAttempts {
            player_id: 650333,
            ..
        })
    ));
    assert_eq!(store.count().unwrap(), 0);
}

#[tokio::test]
async fn malformed_name_fails_after_earlier_rows_are_written() {
    let config = config("[21, 22]", 2);
    let source = StaticSource::new()
        .with_season(
            season(2021),
            csv(&[
                "\"Judge, Aaron\",592450,300,95.0,20.0",
                "\"Arraez, Luis\",650333,400,84.0,1.0",
                "Ichiro,400085,350,86.0,2.0",
                "\"Soto, Juan\",665742,350,92.0,12.0",
            ]),
        )
        .with_season(
            season(2022),
            csv(&[
                "\"Judge, Aaron\",592450,100,99.0,28.0",
                "\"Arraez, Luis\",650333,200,87.0,2.5",
                "Ichiro,400085,150,85.0,1.0",
                "\"Soto, Juan\",665742,150,94.0,15.0",
            ]),
        );
    let store = store(&config);

    let err = run(&config, &source, &store).await.unwrap_err();
    match &err {
        PipelineError::Persistence(PersistError::RecordShape {
            player_id,
            display_name,
        }) => {
            assert_eq!(*player_id, 400085);
            assert_eq!(display_name, "Ichiro");
        }
        other => panic!("expected RecordShape, got {other:?}"),
    }
    assert!(err.source().is_some());

    assert_eq!(store.count().unwrap(), 2);
    assert_eq!(store.get("592450").unwrap().unwrap().last_name, "Judge");
    assert_eq!(store.get("650333").unwrap().unwrap().last_name, "Arraez");
    assert!(store.get("665742").unwrap().is_none());
}

#[tokio::test]
async fn rerun_leaves_store_unchanged() {
    let config = config("[21, 22]", 2);
    let source = StaticSource::new()
        .with_season(
            season(2021),
            csv(&[
                "\"Judge, Aaron\",592450,300,95.0,20.0",
                "\"Arraez, Luis\",650333,400,84.0,1.0",
                "\"Soto, Juan\",665742,350,92.0,12.0",
            ]),
        )
        .with_season(
            season(2022),
            csv(&[
                "\"Judge, Aaron\",592450,100,99.0,28.0",
                "\"Arraez, Luis\",650333,200,87.0,2.5",
                "\"Soto, Juan\",665742,150,94.0,15.0",
            ]),
        );
    let store = store(&config);

    run(&config, &source, &store).await.unwrap();
    let first: Vec<_> = ["592450", "650333", "665742"]
        .iter()
        .map(|id| store.get(id).unwrap().unwrap())
        .collect();

    run(&config, &source, &store).await.unwrap();
    let second: Vec<_> = ["592450", "650333", "665742"]
        .iter()
        .map(|id| store.get(id).unwrap().unwrap())
        .collect();

    assert_eq!(store.count().unwrap(), 3);
    assert_eq!(first, second);
}

#[tokio::test]
async fn seasons_are_fetched_in_configured_order() {
    let config = config("[22, 21]", 2);
    let source = StaticSource::new()
        .with_season(
            season(2021),
            csv(&[
                "\"Judge, Aaron\",592450,300,95.0,20.0",
                "\"Arraez, Luis\",650333,400,84.0,1.0",
            ]),
        )
        .with_season(
            season(2022),
            csv(&[
                "\"Arraez, Luis\",650333,200,87.0,2.5",
                "\"Judge, Aaron\",592450,100,99.0,28.0",
            ]),
        );
    let store = store(&config);

    run(&config, &source, &store).await.unwrap();
    assert_eq!(source.requested(), vec![season(2022), season(2021)]);

    // Weighted values do not depend on the order seasons were joined in.
    let judge = store.get("592450").unwrap().unwrap();
    assert_eq!(dec(&judge, "exit_velocity"), "96.00");
}

#[tokio::test]
async fn season_without_metric_column_is_a_merge_error() {
    let config = config("[21, 22]", 2);
    let source = StaticSource::new()
        .with_season(
            season(2021),
            csv(&[
                "\"Judge, Aaron\",592450,300,95.0,20.0",
                "\"Arraez, Luis\",650333,400,84.0,1.0",
            ]),
        )
        .with_season(
            season(2022),
            [
                "\"last_name, first_name\",player_id,attempts,avg_hit_speed",
                "\"Judge, Aaron\",592450,100,99.0",
                "\"Arraez, Luis\",650333,200,87.0",
            ]
            .join("\n"),
        );
    let store = store(&config);

    let err = run(&config, &source, &store).await.unwrap_err();
    match err {
        PipelineError::Merge(MergeError::SchemaMismatch { season: s, column }) => {
            assert_eq!(s, season(2022));
            assert_eq!(column, "brl_percent");
        }
        other => panic!("expected SchemaMismatch, got {other:?}"),
    }
    assert_eq!(store.count().unwrap(), 0);
}
