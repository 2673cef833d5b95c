//! ForumDB Stress Test Binary
//!
//! Hammers one thread with concurrent voters and concurrent post batches, then
//! checks the invariants that concurrency could break.
//! Run with: `cargo run --bin forum_stress -- [OPTIONS]`
//!
//! This is separate from the regular test suite because:
//! 1. It can take a long time to run
//! 2. It's configurable via command-line arguments
//! 3. It reports throughput
//!
//! # Examples
//!
//! ```bash
//! # Default: 50 voters x 20 votes, 10 posters x 50 batches of 5
//! cargo run --release --bin forum_stress
//!
//! # More contention on the vote tally
//! cargo run --release --bin forum_stress -- --voters 200 --votes 100
//!
//! # With writer logs
//! RUST_LOG=forumdb=debug cargo run --bin forum_stress
//!
//! # Wider group-commit window, four readers
//! FORUMDB_BATCH_TIMEOUT_MS=10 FORUMDB_READERS=4 cargo run --release --bin forum_stress
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use forumdb::config::ENV_PATH;
use forumdb::{
    ForumConfig, ForumService, NewForum, NewPost, NewThread, PostListParams, SortMode, ThreadRef,
    User, Vote,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Stress test configuration
struct Config {
    /// Number of distinct voting users
    voters: usize,
    /// Votes cast by each voter (alternating voices)
    votes_per_voter: usize,
    /// Number of concurrent posting tasks
    posters: usize,
    /// Batches submitted by each poster
    batches_per_poster: usize,
    /// Posts per batch
    batch_size: usize,
    /// Path to database file (or temp if None)
    db_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            voters: 50,
            votes_per_voter: 20,
            posters: 10,
            batches_per_poster: 50,
            batch_size: 5,
            db_path: None,
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--voters" => {
                i += 1;
                config.voters = args[i].parse().expect("Invalid --voters value");
            }
            "--votes" => {
                i += 1;
                config.votes_per_voter = args[i].parse().expect("Invalid --votes value");
            }
            "--posters" => {
                i += 1;
                config.posters = args[i].parse().expect("Invalid --posters value");
            }
            "--batches" => {
                i += 1;
                config.batches_per_poster = args[i].parse().expect("Invalid --batches value");
            }
            "--batch-size" => {
                i += 1;
                config.batch_size = args[i].parse().expect("Invalid --batch-size value");
            }
            "--db" | "-d" => {
                i += 1;
                config.db_path = Some(args[i].clone());
            }
            "--help" | "-h" => {
                println!(
                    r#"ForumDB Stress Test

Usage: forum_stress [OPTIONS]

Options:
  --voters <N>          Distinct voting users (default: 50)
  --votes <N>           Votes per voter (default: 20)
  --posters <N>         Concurrent posting tasks (default: 10)
  --batches <N>         Batches per poster (default: 50)
  --batch-size <N>      Posts per batch (default: 5)
  -d, --db <PATH>       Database path (default: $FORUMDB_PATH, else a temp file)
  -h, --help            Show this help

Environment:
  FORUMDB_PATH, FORUMDB_READERS, FORUMDB_BATCH_TIMEOUT_MS and
  FORUMDB_REQUEST_TIMEOUT_MS configure the database; RUST_LOG sets log levels.
"#
                );
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {arg}");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

fn user(nickname: String) -> User {
    User {
        email: format!("{nickname}@stress.test"),
        nickname,
        fullname: "Stress Tester".to_string(),
        about: String::new(),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "forumdb=info".into()))
        .init();

    let config = parse_args();

    println!("ForumDB Stress Test");
    println!("===================");
    println!("Voters:      {} x {} votes", config.voters, config.votes_per_voter);
    println!(
        "Posters:     {} x {} batches of {}",
        config.posters, config.batches_per_poster, config.batch_size
    );
    println!();

    // --db wins over FORUMDB_PATH; with neither, use a scratch file.
    let mut forum_config = ForumConfig::from_env().expect("read FORUMDB_* settings");
    let path_from_env = std::env::var(ENV_PATH).is_ok_and(|path| !path.trim().is_empty());
    match config.db_path.clone() {
        Some(path) => forum_config.db_path = path.into(),
        None if !path_from_env => {
            let temp_dir = std::env::temp_dir().join(format!("forumdb-stress-{}", std::process::id()));
            std::fs::create_dir_all(&temp_dir).expect("create temp dir");
            forum_config.db_path = temp_dir.join("stress.db");
        }
        None => {}
    }
    let db_path = forum_config.db_path.clone();
    println!("Database:    {}", db_path.display());
    println!();

    let svc = ForumService::open(forum_config)
        .await
        .expect("open database");

    // Setup: one forum, one thread, all users.
    svc.create_user(user("owner".to_string())).await.unwrap();
    for v in 0..config.voters {
        svc.create_user(user(format!("voter{v}"))).await.unwrap();
    }
    svc.create_forum(NewForum {
        slug: "stress".to_string(),
        title: "Stress".to_string(),
        user: "owner".to_string(),
    })
    .await
    .unwrap();
    let thread = svc
        .create_thread(
            "stress",
            NewThread {
                slug: Some("hot-thread".to_string()),
                title: "Hot thread".to_string(),
                author: "owner".to_string(),
                message: "Discuss.".to_string(),
                created: None,
            },
        )
        .await
        .unwrap()
        .into_inner();
    let reference = ThreadRef::Id(thread.id);

    let posts_written = Arc::new(AtomicU64::new(0));
    let votes_cast = Arc::new(AtomicU64::new(0));
    let errors = Arc::new(AtomicU64::new(0));

    info!("starting stress run");
    let start = Instant::now();
    let mut handles = Vec::new();

    for v in 0..config.voters {
        let svc = svc.clone();
        let reference = reference.clone();
        let votes_cast = votes_cast.clone();
        let errors = errors.clone();
        let votes = config.votes_per_voter;

        handles.push(tokio::spawn(async move {
            for i in 0..votes {
                let voice = if (v + i) % 3 == 0 { -1 } else { 1 };
                let vote = Vote {
                    nickname: format!("voter{v}"),
                    voice,
                };
                match svc.vote(&reference, vote).await {
                    Ok(_) => votes_cast.fetch_add(1, Ordering::Relaxed),
                    Err(_) => errors.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }

    for p in 0..config.posters {
        let svc = svc.clone();
        let reference = reference.clone();
        let posts_written = posts_written.clone();
        let errors = errors.clone();
        let batches = config.batches_per_poster;
        let batch_size = config.batch_size;

        handles.push(tokio::spawn(async move {
            let mut last_root = 0;
            for b in 0..batches {
                // Alternate between new roots and replies to this task's last root.
                let posts = (0..batch_size)
                    .map(|k| {
                        let author = "owner";
                        let message = format!("poster {p} batch {b} post {k}");
                        if k % 2 == 1 && last_root != 0 {
                            NewPost::reply(last_root, author, message)
                        } else {
                            NewPost::root(author, message)
                        }
                    })
                    .collect();

                match svc.create_posts(&reference, posts).await {
                    Ok(created) => {
                        posts_written.fetch_add(created.len() as u64, Ordering::Relaxed);
                        if let Some(root) = created.iter().find(|post| post.is_root()) {
                            last_root = root.id;
                        }
                    }
                    Err(_) => {
                        errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
    let elapsed = start.elapsed();

    let written = posts_written.load(Ordering::Relaxed);
    let cast = votes_cast.load(Ordering::Relaxed);
    let error_count = errors.load(Ordering::Relaxed);

    println!();
    println!("Results");
    println!("-------");
    println!("Posts written:   {written}");
    println!("Votes cast:      {cast}");
    println!("Errors:          {error_count}");
    println!("Duration:        {elapsed:?}");
    println!(
        "Throughput:      {:.2} writes/sec",
        (written + cast) as f64 / elapsed.as_secs_f64()
    );
    println!();

    println!("Verifying invariants...");

    let final_thread = svc.resolve_thread(&reference).await.unwrap();
    let expected_tally: i64 = (0..config.voters)
        .map(|v| {
            let last = config.votes_per_voter.checked_sub(1).map(|i| (v + i) % 3);
            match last {
                None => 0,
                Some(0) => -1,
                Some(_) => 1,
            }
        })
        .sum();
    assert_eq!(
        final_thread.votes, expected_tally,
        "tally mismatch: thread says {}, last votes sum to {}",
        final_thread.votes, expected_tally
    );
    println!("  Vote tally:        {} matches last voices ✓", final_thread.votes);

    let read_conn =
        rusqlite::Connection::open_with_flags(&db_path, rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY)
            .unwrap();

    let (rows, sum): (i64, i64) = read_conn
        .query_row(
            "SELECT COUNT(*), COALESCE(SUM(voice), 0) FROM votes WHERE thread = ?1",
            [thread.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(sum, final_thread.votes, "tally drifted from vote rows");
    assert!(rows as usize <= config.voters, "more vote rows than voters");
    println!("  Vote ledger:       {rows} rows, one per voter ✓");

    let tree = svc
        .list_posts(&reference, PostListParams::new(SortMode::Tree))
        .await
        .unwrap();
    assert_eq!(tree.len() as u64, written, "post count mismatch");
    for post in tree.iter().filter(|post| !post.is_root()) {
        let parent = svc.get_post(post.parent).await.unwrap();
        assert!(
            post.path.descends_from(&parent.path) && post.path.depth() == parent.path.depth() + 1,
            "post {} path {} does not extend parent {} path {}",
            post.id,
            post.path,
            parent.id,
            parent.path
        );
    }
    assert!(tree.windows(2).all(|w| w[0].path < w[1].path), "tree order broken");
    println!("  Prefix invariant:  {} posts ✓", tree.len());

    let forum = svc.get_forum("stress").await.unwrap();
    assert_eq!(forum.posts as u64, written, "forum post counter drifted");
    println!("  Forum counter:     {} ✓", forum.posts);

    svc.shutdown().await;

    println!();
    println!("Stress test PASSED ✓");
}
