//! Python bindings (`astrocal._astrocal`)

use crate::config::EngineConfig;
use crate::context::{ProcessingContext, ProcessingType};
use crate::core::calibrate::CalibrationFrame;
use crate::core::pipeline::{CalibrationLibrary, StepSpec};
use crate::engine::{Engine, RunOptions, BIAS_KEY, DARK_KEY, FLAT_KEY};
use crate::registry::algorithms::StabilityFilter;
use crate::types::{CalError, Header, ParamValue, StepType};
use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyBytes;
use std::sync::Arc;

fn to_py_err(e: CalError) -> PyErr {
    let message = format!("{:?}: {}", e.kind(), e);
    match e.exit_code() {
        2 => PyErr::new::<PyValueError, _>(message),
        _ => PyErr::new::<PyRuntimeError, _>(message),
    }
}

fn json_err(e: serde_json::Error) -> PyErr {
    PyErr::new::<PyValueError, _>(format!("Invalid JSON: {}", e))
}

fn parse_header(header_json: Option<&str>, width: usize, height: usize) -> PyResult<Header> {
    match header_json {
        Some(text) => serde_json::from_str(text).map_err(json_err),
        None => Ok(Header::for_image(width, height)),
    }
}

fn calibration_frame(array: PyReadonlyArray2<f32>, exposure_time: Option<f64>) -> CalibrationFrame {
    let mut frame = CalibrationFrame::from_image(array.as_array().to_owned());
    if let Some(t) = exposure_time {
        frame.header.set_float("EXPTIME", t, Some("exposure time (s)"));
    }
    frame
}

/// Calibration engine
#[pyclass(name = "Engine")]
struct PyEngine {
    inner: Arc<Engine>,
}

#[pymethods]
impl PyEngine {
    #[new]
    #[pyo3(signature = (config_json=None, seed_workflows=true))]
    fn new(config_json: Option<&str>, seed_workflows: bool) -> PyResult<Self> {
        let config = match config_json {
            Some(text) => EngineConfig::from_json(text).map_err(to_py_err)?,
            None => EngineConfig::default(),
        };
        let mut engine = Engine::new(config).map_err(to_py_err)?;
        if seed_workflows {
            engine = engine.with_seeded_workflows().map_err(to_py_err)?;
        }
        Ok(Self {
            inner: Arc::new(engine),
        })
    }

    /// Decode FITS bytes into `(image, header_json)`
    fn decode_frame<'py>(&self, py: Python<'py>, data: &[u8]) -> PyResult<(&'py PyArray2<f32>, String)> {
        let (image, header) = self.inner.decode_frame(data).map_err(to_py_err)?;
        let header_json = serde_json::to_string(&header).map_err(|e| PyErr::new::<PyRuntimeError, _>(e.to_string()))?;
        Ok((image.into_pyarray(py), header_json))
    }

    #[pyo3(signature = (image, header_json=None))]
    fn encode_frame(&self, image: PyReadonlyArray2<f32>, header_json: Option<&str>) -> PyResult<Vec<u8>> {
        let image = image.as_array().to_owned();
        let (height, width) = image.dim();
        let header = parse_header(header_json, width, height)?;
        self.inner.encode_frame(&image, &header).map_err(to_py_err)
    }

    /// Full calibration; returns `(image, record_json)`
    #[allow(clippy::too_many_arguments)]
    #[pyo3(signature = (image, session_id, header_json=None, bias=None, dark=None, dark_exptime=None, flat=None, processing_type="test"))]
    fn calibrate<'py>(
        &self,
        py: Python<'py>,
        image: PyReadonlyArray2<f32>,
        session_id: &str,
        header_json: Option<&str>,
        bias: Option<PyReadonlyArray2<f32>>,
        dark: Option<PyReadonlyArray2<f32>>,
        dark_exptime: Option<f64>,
        flat: Option<PyReadonlyArray2<f32>>,
        processing_type: &str,
    ) -> PyResult<(&'py PyArray2<f32>, String)> {
        let image = image.as_array().to_owned();
        let (height, width) = image.dim();
        let header = parse_header(header_json, width, height)?;
        let processing_type = ProcessingType::parse(processing_type).ok_or_else(|| {
            PyErr::new::<PyValueError, _>(format!("Unknown processing type: {}", processing_type))
        })?;
        let ctx = ProcessingContext::of_type(processing_type, session_id);

        let mut library = CalibrationLibrary::new();
        if let Some(bias) = bias {
            library.insert(BIAS_KEY.to_string(), calibration_frame(bias, None));
        }
        if let Some(dark) = dark {
            library.insert(DARK_KEY.to_string(), calibration_frame(dark, dark_exptime));
        }
        if let Some(flat) = flat {
            library.insert(FLAT_KEY.to_string(), calibration_frame(flat, None));
        }

        let engine = Arc::clone(&self.inner);
        let run = py
            .allow_threads(move || engine.calibrate(&ctx, image, header, &library, &RunOptions::default()))
            .map_err(to_py_err)?;
        let record = serde_json::to_string(&run.record).map_err(|e| PyErr::new::<PyRuntimeError, _>(e.to_string()))?;
        Ok((run.image.into_pyarray(py), record))
    }

    /// Run one step; `params` values are passed as strings and coerced by the algorithm
    #[pyo3(signature = (image, step_type, algorithm_id="default", params=None, session_id="python"))]
    fn run_step<'py>(
        &self,
        py: Python<'py>,
        image: PyReadonlyArray2<f32>,
        step_type: &str,
        algorithm_id: &str,
        params: Option<Vec<(String, String)>>,
        session_id: &str,
    ) -> PyResult<(&'py PyArray2<f32>, String)> {
        let step_type = StepType::parse(step_type)
            .ok_or_else(|| PyErr::new::<PyValueError, _>(format!("Unknown step type: {}", step_type)))?;
        let mut spec = StepSpec::new(step_type, algorithm_id);
        for (key, value) in params.unwrap_or_default() {
            spec.params.insert(key, ParamValue::Str(value));
        }
        let image = image.as_array().to_owned();
        let (height, width) = image.dim();
        let ctx = ProcessingContext::test(session_id);
        let engine = Arc::clone(&self.inner);
        let (image, _, outcome) = py
            .allow_threads(move || {
                engine.run_step(&ctx, image, Header::for_image(width, height), &spec, None, &RunOptions::default())
            })
            .map_err(to_py_err)?;
        let outcome = serde_json::to_string(&outcome).map_err(|e| PyErr::new::<PyRuntimeError, _>(e.to_string()))?;
        Ok((image.into_pyarray(py), outcome))
    }

    /// Quality metrics as JSON
    fn analyze_quality(&self, py: Python<'_>, image: PyReadonlyArray2<f32>) -> PyResult<String> {
        let image = image.as_array().to_owned();
        let engine = Arc::clone(&self.inner);
        let metrics = py.allow_threads(move || engine.analyze_quality(&image)).map_err(to_py_err)?;
        serde_json::to_string(&metrics).map_err(|e| PyErr::new::<PyRuntimeError, _>(e.to_string()))
    }

    /// `(id, name, version, stability)` for one step type
    #[pyo3(signature = (step_type, include_experimental=false))]
    fn list_algorithms(&self, step_type: &str, include_experimental: bool) -> PyResult<Vec<(String, String, String, String)>> {
        let step_type = StepType::parse(step_type)
            .ok_or_else(|| PyErr::new::<PyValueError, _>(format!("Unknown step type: {}", step_type)))?;
        let filter = if include_experimental {
            StabilityFilter::All
        } else {
            StabilityFilter::Stable
        };
        Ok(self
            .inner
            .list_algorithms(step_type, filter)
            .into_iter()
            .map(|d| (d.id, d.name, d.version, format!("{:?}", d.stability)))
            .collect())
    }

    fn __repr__(&self) -> String {
        format!("Engine(tile_rows={})", self.inner.config().parallel.tile_rows)
    }
}

fn json_to_py<'py>(py: Python<'py>, text: &str) -> PyResult<&'py PyAny> {
    py.import("json")?.call_method1("loads", (text,))
}

fn to_json<T: serde::Serialize>(value: &T) -> PyResult<String> {
    serde_json::to_string(value).map_err(|e| PyErr::new::<PyRuntimeError, _>(e.to_string()))
}

fn default_engine() -> PyResult<Engine> {
    Engine::new(EngineConfig::default()).map_err(to_py_err)
}

/// Decode FITS bytes into `(image, header)`
#[pyfunction]
#[pyo3(name = "decode_frame")]
fn decode_frame_bytes<'py>(py: Python<'py>, data: &[u8]) -> PyResult<(&'py PyArray2<f32>, &'py PyAny)> {
    let (image, header) = default_engine()?.decode_frame(data).map_err(to_py_err)?;
    let header = json_to_py(py, &to_json(&header)?)?;
    Ok((image.into_pyarray(py), header))
}

/// Full calibration of FITS bytes; returns `(fits_bytes, record)`
#[pyfunction]
#[pyo3(name = "calibrate", signature = (data, bias=None, dark=None, flat=None, session_id="python"))]
fn calibrate_bytes<'py>(
    py: Python<'py>,
    data: &[u8],
    bias: Option<&[u8]>,
    dark: Option<&[u8]>,
    flat: Option<&[u8]>,
    session_id: &str,
) -> PyResult<(&'py PyBytes, &'py PyAny)> {
    let engine = default_engine()?;
    let (image, header) = engine.decode_frame(data).map_err(to_py_err)?;
    let mut library = CalibrationLibrary::new();
    for (key, bytes) in [(BIAS_KEY, bias), (DARK_KEY, dark), (FLAT_KEY, flat)] {
        if let Some(bytes) = bytes {
            let (image, header) = engine.decode_frame(bytes).map_err(to_py_err)?;
            library.insert(key.to_string(), CalibrationFrame::new(image, header));
        }
    }

    let ctx = ProcessingContext::test(session_id);
    let (encoded, record) = py.allow_threads(|| -> Result<(Vec<u8>, String), CalError> {
        let run = engine.calibrate(&ctx, image, header, &library, &RunOptions::default())?;
        let encoded = engine.encode_frame(&run.image, &run.header)?;
        Ok((encoded, serde_json::to_string(&run.record)?))
    })
    .map_err(to_py_err)?;
    Ok((PyBytes::new(py, &encoded), json_to_py(py, &record)?))
}

/// Descriptors of every variant of one step type
#[pyfunction]
#[pyo3(name = "list_algorithms")]
fn list_algorithm_descriptors<'py>(py: Python<'py>, step_type: &str) -> PyResult<&'py PyAny> {
    let step_type = StepType::parse(step_type)
        .ok_or_else(|| PyErr::new::<PyValueError, _>(format!("Unknown step type: {}", step_type)))?;
    let descriptors = default_engine()?.list_algorithms(step_type, StabilityFilter::All);
    json_to_py(py, &to_json(&descriptors)?)
}

#[pymodule]
fn _astrocal(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    m.add_class::<PyEngine>()?;
    m.add_function(wrap_pyfunction!(decode_frame_bytes, m)?)?;
    m.add_function(wrap_pyfunction!(calibrate_bytes, m)?)?;
    m.add_function(wrap_pyfunction!(list_algorithm_descriptors, m)?)?;
    Ok(())
}
