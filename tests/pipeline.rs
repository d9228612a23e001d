//! End-to-end run over a small synthetic build.
//!
//! Fixture topology: root -> (A, B, X), X -> (C, D). All antigenic change
//! sits on the branch into X (a single HA1 substitution), so both models
//! should concentrate their effect there and everything else should fit
//! through potencies and avidities alone.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tempfile::tempdir;

use antigenic_drift::io::write_json;
use antigenic_drift::pipeline::{DriftPipeline, PipelineConfig};
use antigenic_drift::tree::Tree;

fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    let mut file = File::create(&path).unwrap();
    write!(file, "{content}").unwrap();
    path
}

/// root/A carry HA1 "MKTI"; B has a non-epitope change (I4V, masked site),
/// X/C/D an epitope change (M1A, unmasked site).
fn fixture_tree() -> Tree {
    let mut tree = Tree::with_root(Some("root".to_string()));
    let root = tree.root();
    let peptides = [
        (root, "MKTI"),
        (tree.add_child(root, Some("A".to_string()), 1.0), "MKTI"),
        (tree.add_child(root, Some("B".to_string()), 1.0), "MKTV"),
        (tree.add_child(root, Some("X".to_string()), 1.0), "AKTI"),
    ];
    let x = peptides[3].0;
    let c = (tree.add_child(x, Some("C".to_string()), 1.0), "AKTI");
    let d = (tree.add_child(x, Some("D".to_string()), 1.0), "AKTI");
    for (id, peptide) in peptides.into_iter().chain([c, d]) {
        tree.node_mut(id)
            .translations
            .insert("HA1".to_string(), peptide.to_string());
    }
    tree
}

fn fixture_config(dir: &Path) -> PipelineConfig {
    let fasta = write_file(
        dir,
        "seqs.fasta",
        concat!(
            ">A|2012-03-01|north_america|usa|boston\nACGTACGT\n",
            ">B|2012-06-10|europe|france|paris\nACGTACGA\n",
            ">C|2013-02-20|china|china|beijing\nACGAACGT\n",
            ">D|2014-05-05|oceania|australia|sydney\nACGAACGA\n",
        ),
    );
    let coverage = write_file(dir, "coverage.tsv", "A\t10\nB\t5\nC\t8\nD\t2\n");
    // Sera are raised against A and C; crossing the branch into X costs 2.
    let titers = write_file(
        dir,
        "titers.tsv",
        concat!(
            "A\tA\t0.0\nB\tA\t0.0\nC\tA\t2.0\nD\tA\t2.0\n",
            "A\tC\t2.0\nB\tC\t2.0\nC\tC\t0.0\nD\tC\t0.0\n",
        ),
    );
    // Epitope sites 1 and 2 of the four-residue HA1 fixture peptide.
    let masks = write_file(dir, "masks.tsv", "wolf\t1100\n");
    let tree_path = dir.join("tree.json");
    write_json(&fixture_tree(), &tree_path).unwrap();

    PipelineConfig {
        lineage: "h3n2".to_string(),
        resolution: "test".to_string(),
        sequences: fasta,
        translations: None,
        coverage,
        titers,
        masks: Some(masks),
        tree: tree_path,
        clade_table: None,
        store_dir: dir.join("store"),
        build_dir: dir.join("build"),
        viruses_per_month: 50,
        sparsity_weight: 1e-4,
        mask_version: None,
        time_interval: Some((
            NaiveDate::from_ymd_opt(2012, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2015, 1, 1).unwrap(),
        )),
        dropped_strains: Vec::new(),
        resume: false,
    }
}

fn read_artifact(dir: &Path, suffix: &str) -> serde_json::Value {
    let path = dir.join("build").join(format!("h3n2_test_{suffix}"));
    let file = File::open(&path)
        .unwrap_or_else(|e| panic!("missing artifact {}: {e}", path.display()));
    serde_json::from_reader(file).unwrap()
}

#[test]
fn full_run_recovers_the_antigenic_branch() {
    let dir = tempdir().unwrap();
    let mut pipeline = DriftPipeline::new(fixture_config(dir.path())).unwrap();
    pipeline.run().unwrap();

    // Tree model: all effect on the branch into X, nothing else exported.
    let tree_model = read_artifact(dir.path(), "titer_tree_model.json");
    let dtiter = tree_model["dtiter"].as_object().unwrap();
    let x_effect = dtiter["X"].as_f64().unwrap();
    assert!((x_effect - 2.0).abs() < 1e-2, "dtiter[X] = {x_effect}");
    assert!(!dtiter.contains_key("B"));

    // Substitution model: the same signal, expressed as HA1 M1A.
    let subs_model = read_artifact(dir.path(), "titer_subs_model.json");
    let substitution = subs_model["substitution"].as_object().unwrap();
    let m1a = substitution["HA1:M1A"].as_f64().unwrap();
    assert!((m1a - 2.0).abs() < 1e-2, "substitution[HA1:M1A] = {m1a}");
    assert!(!substitution.contains_key("HA1:I4V"));

    // Node annotations: distances, cumulative drift, clade fallback.
    let annotations = read_artifact(dir.path(), "tree_annotations.json");
    let nodes = annotations.as_array().unwrap();
    let by_name = |name: &str| {
        nodes
            .iter()
            .find(|n| n["name"].as_str() == Some(name))
            .unwrap_or_else(|| panic!("no annotation for {name}"))
    };
    assert_eq!(by_name("X")["ep"].as_u64(), Some(1));
    assert_eq!(by_name("X")["ne"].as_u64(), Some(0));
    assert_eq!(by_name("B")["ep"].as_u64(), Some(0));
    assert_eq!(by_name("B")["ne"].as_u64(), Some(1));
    assert_eq!(by_name("root")["cTiter"].as_f64(), Some(0.0));
    let c_ctiter = by_name("C")["cTiter"].as_f64().unwrap();
    assert!((c_ctiter - 2.0).abs() < 1e-2, "cTiter[C] = {c_ctiter}");
    // None of the fixture peptides carry real clade markers.
    assert_eq!(by_name("C")["clade"].as_str(), Some("unassigned"));

    // Predicted-vs-observed export covers every mapped measurement.
    let titers = read_artifact(dir.path(), "titers.json");
    assert_eq!(titers.as_array().unwrap().len(), 8);

    // Run metadata for the visualization layer.
    let meta = read_artifact(dir.path(), "meta.json");
    assert_eq!(meta["lineage"].as_str(), Some("h3n2"));
    assert_eq!(meta["resolution"].as_str(), Some("test"));
    assert!(meta["region_groups"].is_object());
}

#[test]
fn resume_refits_from_the_checkpoint() {
    let dir = tempdir().unwrap();
    let config = fixture_config(dir.path());

    let mut pipeline = DriftPipeline::new(config.clone()).unwrap();
    pipeline.run().unwrap();
    let checkpoint = dir.path().join("store").join("h3n2_test_checkpoint.json");
    assert!(checkpoint.exists());

    // Drop the raw inputs; the resumed run must not touch them.
    std::fs::remove_file(&config.sequences).unwrap();
    std::fs::remove_file(&config.tree).unwrap();
    std::fs::remove_dir_all(dir.path().join("build")).unwrap();

    let mut resumed = DriftPipeline::new(PipelineConfig {
        resume: true,
        ..config
    })
    .unwrap();
    resumed.run().unwrap();

    let tree_model = read_artifact(dir.path(), "titer_tree_model.json");
    let x_effect = tree_model["dtiter"]["X"].as_f64().unwrap();
    assert!((x_effect - 2.0).abs() < 1e-2);
}
