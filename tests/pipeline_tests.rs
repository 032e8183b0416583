use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::Result;
use ndarray::{ArrayD, IxDyn};
use rand::prelude::*;
use tempfile::TempDir;

use bioimage_core::io::save_tensor;
use bioimage_core::processing::get_required_dataset_measures;
use bioimage_core::testing::{EXPECTED_TYPE_DETAIL, PARAMETRIZED_DETAIL, REPRODUCE_DETAIL};
use bioimage_core::{
    create_prediction_pipeline_with_adapter, setup_pre_and_postprocessing, AxisId, DatasetMeasure, Error, Measure,
    MeasureValue, ModelAdapter, ModelDescr, PredictionPipelineOptions, Processing, Sample, Statistic,
    StatsCalculator, Status, Tensor, TensorId, TestOptions,
};

const BCYX: [AxisId; 4] = [AxisId::Batch, AxisId::Channel, AxisId::Y, AxisId::X];

/// Returns its inputs unchanged
#[derive(Debug)]
struct Identity;

impl ModelAdapter for Identity {
    fn forward(&mut self, inputs: &[Option<Tensor>]) -> bioimage_core::Result<Vec<Option<Tensor>>> {
        Ok(inputs.to_vec())
    }

    fn unload(&mut self) {}
}

/// Returns its first input twice
#[derive(Debug)]
struct Duplicate;

impl ModelAdapter for Duplicate {
    fn forward(&mut self, inputs: &[Option<Tensor>]) -> bioimage_core::Result<Vec<Option<Tensor>>> {
        Ok(vec![inputs[0].clone(), inputs[0].clone()])
    }

    fn unload(&mut self) {}
}

/// Always returns a 16x16 image, whatever the input size
#[derive(Debug)]
struct FixedSize;

impl ModelAdapter for FixedSize {
    fn forward(&mut self, _inputs: &[Option<Tensor>]) -> bioimage_core::Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(Tensor::zeros(&[1, 1, 16, 16], BCYX.to_vec())?)])
    }

    fn unload(&mut self) {}
}

/// Produces no tensor for any output
#[derive(Debug)]
struct Skipping;

impl ModelAdapter for Skipping {
    fn forward(&mut self, _inputs: &[Option<Tensor>]) -> bioimage_core::Result<Vec<Option<Tensor>>> {
        Ok(vec![None])
    }

    fn unload(&mut self) {}
}

fn identity(_: &ModelDescr) -> bioimage_core::Result<Box<dyn ModelAdapter>> {
    Ok(Box::new(Identity))
}

fn constant(shape: &[usize], value: f32) -> Tensor {
    Tensor::new(ArrayD::from_elem(IxDyn(shape), value), BCYX.to_vec()).unwrap()
}

fn random(rng: &mut StdRng, shape: &[usize]) -> Tensor {
    let len: usize = shape.iter().product();
    let values: Vec<f32> = (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect();
    Tensor::new(ArrayD::from_shape_vec(IxDyn(shape), values).unwrap(), BCYX.to_vec()).unwrap()
}

fn raw_sample(tensor: Tensor) -> Sample {
    Sample::from_members([(TensorId::new("raw"), tensor)])
}

fn write_model(dir: &Path, yaml: &str, input: &Tensor, output: &Tensor) -> Result<ModelDescr> {
    save_tensor(dir.join("test_input.npy"), input)?;
    save_tensor(dir.join("test_output.npy"), output)?;
    let path = dir.join("rdf.yaml");
    fs::write(&path, yaml)?;
    Ok(ModelDescr::from_path(&path)?)
}

fn image_model(x_size: &str, out_x_size: &str) -> String {
    format!(
        r#"
format_version: 0.5.3
type: model
name: image model
inputs:
  - id: raw
    axes:
      - type: batch
      - {{type: channel, channel_names: [c0]}}
      - {{type: space, id: y, size: 16}}
      - {{type: space, id: x, size: {}}}
    test_tensor: {{source: test_input.npy}}
    data: {{type: float32}}
outputs:
  - id: out
    axes:
      - type: batch
      - {{type: channel, channel_names: [c0]}}
      - {{type: space, id: y, size: 16}}
      - {{type: space, id: x, size: {}}}
    test_tensor: {{source: test_output.npy}}
    data: {{type: float32}}
weights:
  onnx: {{source: weights.onnx}}
"#,
        x_size, out_x_size
    )
}

const NORMALIZED_MODEL: &str = r#"
format_version: 0.4.10
name: normalized
inputs:
  - name: raw
    axes: bcyx
    data_type: float32
    shape: [1, 1, 4, 4]
    preprocessing:
      - name: zero_mean_unit_variance
        kwargs: {mode: per_dataset}
outputs:
  - name: out
    axes: bcyx
    data_type: float32
    shape: [1, 1, 4, 4]
weights: {}
"#;

/// Output statistics are matched to the dataset statistics of the input
const MATCHED_MODEL: &str = r#"
format_version: 0.4.10
name: matched
inputs:
  - name: raw
    axes: bcyx
    data_type: float32
    shape: [1, 1, 4, 4]
    preprocessing:
      - name: zero_mean_unit_variance
        kwargs: {mode: per_dataset}
outputs:
  - name: out
    axes: bcyx
    data_type: float32
    shape: [1, 1, 4, 4]
    postprocessing:
      - name: scale_mean_variance
        kwargs: {mode: per_dataset, reference_tensor: raw}
weights: {}
"#;

fn dataset_mean(value: f64) -> (DatasetMeasure, MeasureValue) {
    (DatasetMeasure::new("raw", None, Statistic::Mean), MeasureValue::Scalar(value))
}

#[test]
fn test_identity_model_output_equals_input() -> Result<()> {
    let dir = TempDir::new()?;
    let mut rng = StdRng::seed_from_u64(7);
    let input = random(&mut rng, &[1, 1, 128, 128]);
    let yaml = image_model("128", "128").replace("size: 16", "size: 128");
    let model = write_model(dir.path(), &yaml, &input, &input)?;

    let outputs = create_prediction_pipeline_with_adapter(&model, Box::new(Identity), PredictionPipelineOptions::new())?
        .scoped(|pp| pp.forward(&[Some(input.clone())]))?;
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].as_ref().map(Tensor::data), Some(input.data()));

    let summary = bioimage_core::test_model_with_adapter(&model, identity, &TestOptions::new());
    assert_eq!(summary.status, Status::Passed, "{}", summary);
    let names: Vec<&str> = summary.details.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec![EXPECTED_TYPE_DETAIL, REPRODUCE_DETAIL]);
    Ok(())
}

#[test]
fn test_disagreeing_outputs_fail_the_summary() -> Result<()> {
    let dir = TempDir::new()?;
    let input = constant(&[1, 1, 16, 16], 1.0);
    let expected = input.map(|v| v + 0.01);
    let model = write_model(dir.path(), &image_model("16", "16"), &input, &expected)?;

    let summary = bioimage_core::test_model_with_adapter(&model, identity, &TestOptions::new());
    assert_eq!(summary.status, Status::Failed);
    let detail = &summary.details[1];
    assert_eq!(detail.name, REPRODUCE_DETAIL);
    assert!(detail.errors[0].msg.contains("Mismatched elements: 256 / 256"));

    let relaxed = bioimage_core::test_model_with_adapter(&model, identity, &TestOptions::new().set_decimal(1));
    assert_eq!(relaxed.status, Status::Passed, "{}", relaxed);
    Ok(())
}

#[test]
fn test_output_count_mismatch_is_reported() -> Result<()> {
    let dir = TempDir::new()?;
    let input = constant(&[1, 1, 16, 16], 1.0);
    let model = write_model(dir.path(), &image_model("16", "16"), &input, &input)?;

    let options = TestOptions::new().set_weight_format(bioimage_core::WeightsFormat::Onnx);
    let duplicate = |_: &ModelDescr| Ok(Box::new(Duplicate) as Box<dyn ModelAdapter>);
    let summary = bioimage_core::test_model_with_adapter(&model, duplicate, &options);
    assert_eq!(summary.status, Status::Failed);
    let error = &summary.details[1].errors[0];
    assert_eq!(error.msg, "Expected 1 outputs, but got 2");
    assert_eq!(error.loc, vec!["weights".to_string(), "onnx".to_string()]);
    Ok(())
}

#[test]
fn test_backend_errors_become_failed_details() -> Result<()> {
    let dir = TempDir::new()?;
    let input = constant(&[1, 1, 16, 16], 1.0);
    let model = write_model(dir.path(), &image_model("16", "16"), &input, &input)?;

    let summary = bioimage_core::test_model_with_adapter(
        &model,
        |_: &ModelDescr| Err(Error::BackendUnavailable("no runtime".to_string())),
        &TestOptions::new(),
    );
    assert_eq!(summary.status, Status::Failed);
    let error = &summary.details[1].errors[0];
    assert!(error.msg.contains("no runtime"));
    assert_eq!(error.loc, vec!["weights".to_string()]);
    assert!(!error.traceback.is_empty());
    Ok(())
}

#[test]
fn test_parametrized_sizes_follow_size_reference() -> Result<()> {
    let dir = TempDir::new()?;
    let input = constant(&[1, 1, 16, 24], 0.5);
    let yaml = image_model("{min: 16, step: 8}", "{tensor_id: raw, axis_id: x}");
    let model = write_model(dir.path(), &yaml, &input, &input)?;

    let summary = bioimage_core::test_model_with_adapter(&model, identity, &TestOptions::new());
    assert_eq!(summary.status, Status::Passed, "{}", summary);
    assert_eq!(summary.details.last().map(|d| d.name.as_str()), Some(PARAMETRIZED_DETAIL));

    let fixed_size = |_: &ModelDescr| Ok(Box::new(FixedSize) as Box<dyn ModelAdapter>);
    let summary = bioimage_core::test_model_with_adapter(&model, fixed_size, &TestOptions::new());
    let detail = summary.details.iter().find(|d| d.name == PARAMETRIZED_DETAIL).unwrap();
    assert_eq!(detail.status, Status::Failed);
    assert!(detail.errors[0].msg.starts_with("(n=1)"), "{}", detail.errors[0].msg);
    Ok(())
}

#[test]
fn test_streaming_dataset_mean() -> Result<()> {
    let mean = Measure::Dataset(DatasetMeasure::new("raw", None, Statistic::Mean));
    let mut calculator = StatsCalculator::new([mean])?;
    for value in [1.0, 2.0, 3.0] {
        calculator.update(&raw_sample(constant(&[1, 1, 4, 4], value)))?;
    }
    let (measure, value) = dataset_mean(2.0);
    assert_eq!(calculator.finalize()?.get(&measure), Some(&value));

    let model = ModelDescr::from_yaml_str(NORMALIZED_MODEL, ".")?;
    let dataset: Vec<Sample> = [1.0, 2.0, 3.0].iter().map(|&v| raw_sample(constant(&[1, 1, 4, 4], v))).collect();
    let options = PredictionPipelineOptions::new().set_dataset_for_initial_statistics(dataset);
    let mut pp = create_prediction_pipeline_with_adapter(&model, Box::new(Identity), options)?;
    pp.load()?;

    let mut sample = raw_sample(constant(&[1, 1, 4, 4], 4.0));
    pp.apply_preprocessing(&mut sample)?;
    let expected = 2.0 / ((2.0f64 / 3.0).sqrt() + 1e-6);
    let normalized = sample.require(&TensorId::new("raw"))?;
    assert!(normalized.data().iter().all(|&v| (v as f64 - expected).abs() < 1e-4));
    Ok(())
}

#[test]
fn test_statistics_are_deterministic() -> Result<()> {
    let measures = vec![
        Measure::Dataset(DatasetMeasure::new("raw", None, Statistic::Std)),
        Measure::Dataset(DatasetMeasure::new("raw", Some(vec![AxisId::Batch, AxisId::Y, AxisId::X]), Statistic::Quantile(0.9))),
    ];
    let mut rng = StdRng::seed_from_u64(3);
    let samples: Vec<Sample> = (0..5).map(|_| raw_sample(random(&mut rng, &[1, 2, 8, 8]))).collect();

    let run = || -> Result<HashMap<DatasetMeasure, MeasureValue>> {
        let mut calculator = StatsCalculator::new(measures.clone())?;
        for sample in &samples {
            calculator.update(sample)?;
        }
        Ok(calculator.finalize()?)
    };
    assert_eq!(run()?, run()?);
    Ok(())
}

#[test]
fn test_shared_measures_are_computed_once() -> Result<()> {
    let model = ModelDescr::from_yaml_str(MATCHED_MODEL, ".")?;
    let required = get_required_dataset_measures(&model)?;
    let shared: Vec<&DatasetMeasure> = required.pre.intersection(&required.post).collect();
    assert_eq!(shared.len(), 2);

    let dataset: Vec<Sample> = [1.0, 2.0, 3.0]
        .iter()
        .map(|&v| {
            let mut sample = raw_sample(constant(&[1, 1, 4, 4], v));
            sample.insert(TensorId::new("out"), constant(&[1, 1, 4, 4], 2.0 * v));
            sample
        })
        .collect();
    let setup = setup_pre_and_postprocessing(&model, dataset, false, None)?;
    let calculators: Vec<&StatsCalculator> = setup
        .pre
        .iter()
        .chain(&setup.post)
        .filter_map(|p| match p {
            Processing::UpdateStats(u) => Some(&u.calculator),
            _ => None,
        })
        .collect();
    assert_eq!(calculators.len(), 2);
    for measure in shared {
        let owners = calculators
            .iter()
            .filter(|c| c.required_measures().contains(&Measure::Dataset(measure.clone())))
            .count();
        assert_eq!(owners, 1, "{:?} is aggregated {} times", measure, owners);
    }
    Ok(())
}

#[test]
fn test_fixed_statistics_override_dataset() -> Result<()> {
    let model = ModelDescr::from_yaml_str(NORMALIZED_MODEL, ".")?;
    let fixed: HashMap<DatasetMeasure, MeasureValue> = [
        dataset_mean(10.0),
        (DatasetMeasure::new("raw", None, Statistic::Std), MeasureValue::Scalar(2.0)),
    ]
    .into_iter()
    .collect();
    let dataset: Vec<Sample> = [1.0, 2.0, 3.0].iter().map(|&v| raw_sample(constant(&[1, 1, 4, 4], v))).collect();
    let options = PredictionPipelineOptions::new()
        .set_dataset_for_initial_statistics(dataset)
        .set_fixed_dataset_statistics(fixed);
    let mut pp = create_prediction_pipeline_with_adapter(&model, Box::new(Identity), options)?;
    pp.load()?;

    let mut sample = raw_sample(constant(&[1, 1, 4, 4], 14.0));
    pp.apply_preprocessing(&mut sample)?;
    let normalized = sample.require(&TensorId::new("raw"))?;
    assert!(normalized.data().iter().all(|&v| (v - 2.0).abs() < 1e-5));

    let (measure, value) = dataset_mean(10.0);
    assert_eq!(sample.stat.get(&Measure::Dataset(measure)), Some(&value));
    Ok(())
}

#[test]
fn test_tensors_without_steps_keep_their_dtype() -> Result<()> {
    let dir = TempDir::new()?;
    let input = constant(&[1, 1, 16, 16], 3.0);
    let model = write_model(dir.path(), &image_model("16", "16"), &input, &input)?;

    let setup = setup_pre_and_postprocessing(&model, Vec::new(), false, None)?;
    assert!(setup.pre.iter().any(|p| matches!(p, Processing::EnsureDtype(_))));
    assert!(setup.post.iter().any(|p| matches!(p, Processing::EnsureDtype(_))));
    Ok(())
}

#[test]
fn test_skipped_tensors_pass_through_the_pipeline() -> Result<()> {
    let dir = TempDir::new()?;
    let input = constant(&[1, 1, 16, 16], 1.0);
    let model = write_model(dir.path(), &image_model("16", "16"), &input, &input)?;
    let outputs = create_prediction_pipeline_with_adapter(&model, Box::new(Skipping), PredictionPipelineOptions::new())?
        .scoped(|pp| pp.forward(&[None]))?;
    assert_eq!(outputs, vec![None]);

    // no initial dataset, so the dataset statistics of `raw` are never observed
    let model = ModelDescr::from_yaml_str(NORMALIZED_MODEL, ".")?;
    let outputs = create_prediction_pipeline_with_adapter(&model, Box::new(Identity), PredictionPipelineOptions::new())?
        .scoped(|pp| pp.forward(&[None]))?;
    assert_eq!(outputs, vec![None]);
    Ok(())
}

#[test]
fn test_missing_output_fails_the_summary() -> Result<()> {
    let dir = TempDir::new()?;
    let input = constant(&[1, 1, 16, 16], 1.0);
    let model = write_model(dir.path(), &image_model("16", "16"), &input, &input)?;

    let skipping = |_: &ModelDescr| Ok(Box::new(Skipping) as Box<dyn ModelAdapter>);
    let summary = bioimage_core::test_model_with_adapter(&model, skipping, &TestOptions::new());
    assert_eq!(summary.status, Status::Failed);
    let detail = summary.details.iter().find(|d| d.name == REPRODUCE_DETAIL).unwrap();
    assert_eq!(detail.errors[0].msg.trim_end(), "Output 'out' is missing");
    Ok(())
}

#[test]
fn test_online_statistics_follow_inference_samples() -> Result<()> {
    let model = ModelDescr::from_yaml_str(NORMALIZED_MODEL, ".")?;
    let dataset = || -> Vec<Sample> { [1.0, 2.0, 3.0].iter().map(|&v| raw_sample(constant(&[1, 1, 4, 4], v))).collect() };
    let run_twice = |keep_updating: bool| -> Result<Vec<f32>> {
        let options = PredictionPipelineOptions::new()
            .set_dataset_for_initial_statistics(dataset())
            .keep_updating_initial_dataset_statistics(keep_updating);
        let outputs = create_prediction_pipeline_with_adapter(&model, Box::new(Identity), options)?.scoped(|pp| {
            let mut firsts = Vec::new();
            for _ in 0..2 {
                let outputs = pp.forward(&[Some(constant(&[1, 1, 4, 4], 4.0))])?;
                let out = outputs[0].as_ref().ok_or_else(|| Error::MissingTensor(TensorId::new("out")))?;
                firsts.push(out.data().iter().copied().next().unwrap_or(f32::NAN));
            }
            Ok(firsts)
        })?;
        Ok(outputs)
    };

    let offline = run_twice(false)?;
    let frozen = 2.0 / ((2.0f64 / 3.0).sqrt() + 1e-6);
    assert!(offline.iter().all(|&v| (v as f64 - frozen).abs() < 1e-4), "{:?}", offline);

    // 1, 2, 3 and 4 seen: mean 2.5, std sqrt(1.25)
    let online = run_twice(true)?;
    let first = 1.5 / (1.25f64.sqrt() + 1e-6);
    assert!((online[0] as f64 - first).abs() < 1e-4, "{:?}", online);
    // a second 4 moves the mean to 2.8 and the std to sqrt(1.36)
    let second = 1.2 / (1.36f64.sqrt() + 1e-6);
    assert!((online[1] as f64 - second).abs() < 1e-4, "{:?}", online);
    Ok(())
}
