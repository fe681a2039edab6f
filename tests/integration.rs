//! End-to-end tests for partitioning and checkpoint conversion

mod common;

use candle_core::{DType, Device, Tensor};
use chexprep::checkpoint::{inspect_safetensors, load_state_dict};
use chexprep::data::Split;
use chexprep::{
    CheckpointConfig, CheckpointConverter, ChexNet, DatasetPartitioner, DenseNetConfig, Error,
    PartitionConfig, PrepConfig,
};
use common::{first_value, legacy_name, tiny_architecture};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write_label_file(dir: &Path, name: &str, rows: usize) -> Vec<String> {
    let mut content = String::from("Filename,Label,LabelText\n");
    let mut images = Vec::with_capacity(rows);
    for i in 0..rows {
        let image = format!("CXR{}_IM-{:04}.png", i, i * 7);
        content.push_str(&format!("{},{},\"report {}, no acute findings\"\n", image, i % 14, i));
        images.push(image);
    }
    fs::write(dir.join(name), content).unwrap();
    images
}

fn partition_config(root: &Path) -> PartitionConfig {
    let mut config = PartitionConfig::default();
    config.source_dir = root.join("image_labels_csv");
    config.csv_dir = root.join("csv");
    config.jsonl_dir = root.join("json");
    config
}

fn read_jsonl(path: &Path) -> Vec<serde_json::Map<String, Value>> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn test_partition_writes_six_artifacts_per_file() {
    let root = TempDir::new().unwrap();
    let source = root.path().join("image_labels_csv");
    fs::create_dir_all(&source).unwrap();
    write_label_file(&source, "findings.csv", 50);
    write_label_file(&source, "impression.csv", 20);
    fs::write(source.join("README.txt"), "not a label file").unwrap();

    let summaries = DatasetPartitioner::new(partition_config(root.path())).run().unwrap();

    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].source, "findings");
    assert_eq!(summaries[0].split_sizes, [30, 10, 10]);
    assert_eq!(summaries[1].source, "impression");
    assert_eq!(summaries[1].split_sizes, [12, 4, 4]);

    for source in ["findings", "impression"] {
        for split in Split::ALL {
            assert!(root.path().join("csv").join(format!("{}_{}.csv", source, split)).is_file());
            assert!(root.path().join("json").join(format!("{}_{}.jsonl", source, split)).is_file());
        }
    }
    assert_eq!(summaries.iter().map(|s| s.files.len()).sum::<usize>(), 12);
}

#[test]
fn test_jsonl_ids_are_original_row_indices() {
    let root = TempDir::new().unwrap();
    let source = root.path().join("image_labels_csv");
    fs::create_dir_all(&source).unwrap();
    let images = write_label_file(&source, "findings.csv", 40);

    DatasetPartitioner::new(partition_config(root.path())).run().unwrap();

    let mut seen = BTreeSet::new();
    for split in Split::ALL {
        let records = read_jsonl(&root.path().join("json").join(format!("findings_{}.jsonl", split)));
        for record in records {
            let keys: Vec<&str> = record.keys().map(String::as_str).collect();
            assert_eq!(keys, vec!["id", "img", "label", "text"]);

            let id: usize = record["id"].as_str().unwrap().parse().unwrap();
            assert_eq!(record["img"], Value::from(images[id].clone()));
            assert_eq!(record["label"], Value::from((id % 14) as i64));
            assert!(seen.insert(id), "row {} exported twice", id);
        }
    }
    assert_eq!(seen, (0..40).collect::<BTreeSet<_>>());
}

#[test]
fn test_csv_partitions_read_back() {
    let root = TempDir::new().unwrap();
    let source = root.path().join("image_labels_csv");
    fs::create_dir_all(&source).unwrap();
    let images = write_label_file(&source, "findings.csv", 25);

    DatasetPartitioner::new(partition_config(root.path())).run().unwrap();

    let mut total = 0;
    for split in Split::ALL {
        let path = root.path().join("csv").join(format!("findings_{}.csv", split));
        let mut reader = csv::Reader::from_path(&path).unwrap();
        assert_eq!(reader.headers().unwrap().iter().collect::<Vec<_>>(), vec!["", "img", "label", "text"]);

        for record in reader.records() {
            let record = record.unwrap();
            let index: usize = record[0].parse().unwrap();
            assert_eq!(&record[1], images[index].as_str());
            assert_eq!(&record[2], (index % 14).to_string().as_str());
            assert_eq!(&record[3], format!("report {}, no acute findings", index).as_str());
            total += 1;
        }
    }
    assert_eq!(total, 25);
}

#[test]
fn test_partition_is_reproducible() {
    let root = TempDir::new().unwrap();
    let source = root.path().join("image_labels_csv");
    fs::create_dir_all(&source).unwrap();
    write_label_file(&source, "findings.csv", 60);

    let config = partition_config(root.path());
    let partitioner = DatasetPartitioner::new(config.clone());

    partitioner.run().unwrap();
    let first = fs::read(config.jsonl_dir.join("findings_train.jsonl")).unwrap();
    partitioner.run().unwrap();
    let second = fs::read(config.jsonl_dir.join("findings_train.jsonl")).unwrap();

    assert_eq!(first, second);
}

#[test]
fn test_missing_source_directory_is_fatal() {
    let root = TempDir::new().unwrap();
    let err = DatasetPartitioner::new(partition_config(root.path())).run().unwrap_err();
    assert!(matches!(err, Error::DatasetNotFound(_)));
}

#[test]
fn test_malformed_file_is_fatal() {
    let root = TempDir::new().unwrap();
    let source = root.path().join("image_labels_csv");
    fs::create_dir_all(&source).unwrap();
    fs::write(source.join("broken.csv"), "Filename,Label,LabelText\na.png,1\n").unwrap();

    let err = DatasetPartitioner::new(partition_config(root.path())).run().unwrap_err();
    assert!(matches!(err, Error::MalformedTable { .. }));
}

/// Legacy checkpoint for `architecture` where tensor `i` (in name order) is filled with `i`
fn write_legacy_safetensors(path: &Path, architecture: &DenseNetConfig) -> HashMap<String, f32> {
    let model = ChexNet::new(architecture, &Device::Cpu).unwrap();
    let mut tensors = HashMap::new();
    let mut expected = HashMap::new();

    for (i, (name, shape)) in model.parameter_shapes().unwrap().into_iter().enumerate() {
        let value = i as f32;
        tensors.insert(legacy_name(&name), Tensor::full(value, shape, &Device::Cpu).unwrap());
        expected.insert(name, value);
    }
    candle_core::safetensors::save(&tensors, path).unwrap();
    expected
}

fn checkpoint_config(root: &Path) -> CheckpointConfig {
    let mut config = CheckpointConfig::default();
    config.checkpoint_path = root.join("models/model.safetensors");
    config.state_dict_key = None;
    config.output_path = root.join("models/saved_chexnet.safetensors");
    config.num_classes = 5;
    config
}

#[test]
fn test_legacy_name_helper_produces_legacy_keys() {
    assert_eq!(
        legacy_name("densenet121.features.denseblock1.denselayer2.norm1.weight"),
        "module.densenet121.features.denseblock1.denselayer2.norm.1.weight"
    );
    assert_eq!(legacy_name("densenet121.classifier.0.bias"), "module.densenet121.classifier.0.bias");
}

#[test]
fn test_convert_legacy_checkpoint() {
    let root = TempDir::new().unwrap();
    fs::create_dir_all(root.path().join("models")).unwrap();
    let config = checkpoint_config(root.path());
    let architecture = tiny_architecture(5);
    let expected = write_legacy_safetensors(&config.checkpoint_path, &architecture);

    let outcome = CheckpointConverter::new(config.clone(), Device::Cpu)
        .unwrap()
        .with_architecture(architecture)
        .convert()
        .unwrap();

    assert!(outcome.checkpoint_found());
    assert_eq!(outcome.tensors_loaded, expected.len());
    let report = outcome.remap.unwrap();
    assert_eq!(report.stripped, expected.len());
    // five dense layers, each with two batch norms (4 tensors) and two convs
    assert_eq!(report.renamed, 5 * (2 * 4 + 2));

    let saved = load_state_dict(&config.output_path, None, &Device::Cpu).unwrap();
    assert_eq!(saved.len(), expected.len() - 2);
    assert_eq!(outcome.tensors_saved, saved.len());
    for (name, tensor) in &saved {
        assert!(name.starts_with("features."), "unexpected key {}", name);
        let full_name = format!("densenet121.{}", name);
        assert_eq!(first_value(tensor), expected[&full_name], "value of {}", name);
    }
}

#[test]
fn test_keep_classifier_writes_head() {
    let root = TempDir::new().unwrap();
    fs::create_dir_all(root.path().join("models")).unwrap();
    let mut config = checkpoint_config(root.path());
    config.keep_classifier = true;
    let architecture = tiny_architecture(5);
    write_legacy_safetensors(&config.checkpoint_path, &architecture);

    CheckpointConverter::new(config.clone(), Device::Cpu)
        .unwrap()
        .with_architecture(architecture)
        .convert()
        .unwrap();

    let summary = inspect_safetensors(&config.output_path).unwrap();
    let head = summary.iter().find(|t| t.name == "classifier.0.weight").unwrap();
    assert_eq!(head.shape, vec![5, 20]);
}

#[test]
fn test_missing_checkpoint_still_saves_model() {
    let root = TempDir::new().unwrap();
    let config = checkpoint_config(root.path());

    let outcome = CheckpointConverter::new(config.clone(), Device::Cpu)
        .unwrap()
        .with_architecture(tiny_architecture(5))
        .convert()
        .unwrap();

    assert!(!outcome.checkpoint_found());
    assert_eq!(outcome.tensors_loaded, 0);
    assert!(config.output_path.is_file());

    let saved = load_state_dict(&config.output_path, None, &Device::Cpu).unwrap();
    // freshly initialized batch norm scale
    assert_eq!(first_value(&saved["features.norm5.weight"]), 1.0);
}

#[test]
fn test_mismatched_checkpoint_is_fatal() {
    let root = TempDir::new().unwrap();
    fs::create_dir_all(root.path().join("models")).unwrap();
    let config = checkpoint_config(root.path());
    // written for a deeper network than the one being loaded
    write_legacy_safetensors(&config.checkpoint_path, &tiny_architecture(5));

    let err = CheckpointConverter::new(config.clone(), Device::Cpu)
        .unwrap()
        .with_architecture(DenseNetConfig {
            block_config: vec![2, 2],
            ..tiny_architecture(5)
        })
        .convert()
        .unwrap_err();

    assert!(matches!(err, Error::StateDictMismatch(_)));
    assert!(!config.output_path.exists());
}

#[test]
fn test_base_weights_initialize_backbone() {
    let root = TempDir::new().unwrap();
    let architecture = tiny_architecture(5);
    let base_path: PathBuf = root.path().join("densenet_base.safetensors");

    let reference = ChexNet::new(&architecture, &Device::Cpu).unwrap();
    let mut base: HashMap<String, Tensor> = reference
        .backbone_state(false)
        .unwrap()
        .into_iter()
        .map(|(name, tensor)| (name, tensor.ones_like().unwrap().affine(0.0, 3.0).unwrap()))
        .collect();
    base.insert("classifier.weight".to_string(), Tensor::zeros((1000, 20), DType::F32, &Device::Cpu).unwrap());
    candle_core::safetensors::save(&base, &base_path).unwrap();

    let mut config = checkpoint_config(root.path());
    config.base_weights = Some(base_path);

    CheckpointConverter::new(config.clone(), Device::Cpu)
        .unwrap()
        .with_architecture(architecture)
        .convert()
        .unwrap();

    let saved = load_state_dict(&config.output_path, None, &Device::Cpu).unwrap();
    assert!(saved.values().all(|t| first_value(t) == 3.0));
}

#[test]
fn test_run_all_with_defaults() {
    let root = TempDir::new().unwrap();
    let source = root.path().join("image_labels_csv");
    fs::create_dir_all(&source).unwrap();
    write_label_file(&source, "findings.csv", 10);

    let mut config = PrepConfig::default();
    config.resolve_paths(root.path());

    let report = chexprep::run_all(&config).unwrap();

    assert_eq!(report.partitions.len(), 1);
    assert!(!report.conversion.checkpoint_found());
    assert_eq!(report.conversion.output_path, root.path().join("models/saved_chexnet.safetensors"));

    let summary = inspect_safetensors(&report.conversion.output_path).unwrap();
    assert!(summary.iter().all(|t| t.name.starts_with("features.")));
    let conv0 = summary.iter().find(|t| t.name == "features.conv0.weight").unwrap();
    assert_eq!(conv0.shape, vec![64, 3, 7, 7]);
}
