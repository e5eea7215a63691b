//! Property tests for eviction
//!
//! - The rotation chain never holds more than MAX_GENERATIONS archives
//! - Files under an ignored folder or with an ignored name are never evicted

use camino::{Utf8Path, Utf8PathBuf};
use logrunner::metrics::EngineMetrics;
use logrunner::services::{Evictor, MAX_GENERATIONS, ScanLoop};
use logrunner::{EngineConfig, IgnoreSet};
use proptest::prelude::*;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::watch;

fn scratch() -> (TempDir, Utf8PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let root = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
    fs::create_dir_all(root.join("active")).unwrap();
    (temp_dir, root)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn rotation_depth_is_bounded(rounds in 1usize..12) {
        let (_temp_dir, root) = scratch();
        let evictor = Evictor::new(root.join("active"), root.join("archive"));
        let relative = Utf8Path::new("service/app.log");
        fs::create_dir_all(root.join("active/service")).unwrap();

        for round in 0..rounds {
            fs::write(root.join("active").join(relative), format!("round {}", round)).unwrap();
            evictor.retire(relative).unwrap();
        }

        let chain = evictor.chain_for(relative);
        let expected: Vec<usize> = (0..rounds.min(MAX_GENERATIONS)).collect();
        prop_assert_eq!(chain.existing(), expected);
        prop_assert!(!chain.generation_path(MAX_GENERATIONS).exists());
    }

    #[test]
    fn ignored_paths_are_never_evicted(
        needle in "[a-z]{3,6}",
        prefix in "[a-z]{0,3}",
        suffix in "[a-z]{0,3}",
        size in 100usize..400,
    ) {
        let (_temp_dir, root) = scratch();
        let active = root.join("active");
        let folder = format!("{}{}{}", prefix, needle, suffix);
        let file = format!("{}{}.log", needle, suffix);
        fs::create_dir_all(active.join(&folder).join("nested")).unwrap();
        fs::write(active.join(&folder).join("nested/inner.log"), vec![b'a'; size]).unwrap();
        fs::write(active.join(&file), vec![b'b'; size]).unwrap();

        let config = EngineConfig::new(&active, root.join("archive"), 50)
            .with_ignore(IgnoreSet::new([needle.as_str()], [needle.as_str()]));
        let scan = ScanLoop::new(Arc::new(config), Arc::new(EngineMetrics::new()));
        let (_tx, rx) = watch::channel(false);

        let report = scan.run_cycle(&rx);

        prop_assert!(report.retired.is_empty());
        prop_assert_eq!(fs::metadata(active.join(&folder).join("nested/inner.log")).unwrap().len(), size as u64);
        prop_assert_eq!(fs::metadata(active.join(&file)).unwrap().len(), size as u64);
    }
}
