//! Static configuration of the filter bank.
//!
//! [`ImmConfig`] is the serde record (JSON on disk). [`ModelSet::from_config`]
//! validates it and compiles every matrix into a [`MatrixFormula`], bound to
//! the configured parameters. The resulting [`ModelSet`] is immutable and is
//! shared by estimators through an `Arc`.

use crate::{
    error::{ImmError, ImmResult},
    expr::{Entry, Expr, MatrixFormula, TIME_STEP},
    kf::{FilterType, LinearModel},
    linalg::{is_symmetric_psd, min_eigenvalue},
    mode::ModeProbabilities,
    projection::{CovarianceExpansion, Projection, SpaceAdapter},
    types::{DMat, DVec, Measurement},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    sync::Arc,
};
use tracing::info;

/// Time steps at which dt-dependent noise matrices are checked for PSD.
const SAMPLE_TIME_STEPS: [f64; 4] = [1e-3, 0.1, 1.0, 10.0];

// ---------------------------------------------------------------------------
// Serde record
// ---------------------------------------------------------------------------

/// A matrix entry: a number or an expression over `dt` and the parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntrySpec {
    Number(f64),
    Expr(String),
}

impl From<f64> for EntrySpec {
    fn from(v: f64) -> Self {
        EntrySpec::Number(v)
    }
}

impl From<&str> for EntrySpec {
    fn from(s: &str) -> Self {
        EntrySpec::Expr(s.to_string())
    }
}

/// Row-major matrix of entries.
pub type MatrixSpec = Vec<Vec<EntrySpec>>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub name: String,
    pub filter_type: FilterType,
    /// F
    pub transition_matrix: MatrixSpec,
    /// H
    pub measurement_control_matrix: MatrixSpec,
    /// Q
    pub process_noise_matrix: MatrixSpec,
    /// R
    pub measurement_uncertainty_matrix: MatrixSpec,
    /// B
    pub input_control_matrix: MatrixSpec,
    /// Overrides the global projection for this model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<ProjectionConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectionConfig {
    pub expansion_matrix: MatrixSpec,
    pub expansion_matrix_covariance: MatrixSpec,
    pub expansion_matrix_s: MatrixSpec,
    pub shrinking_matrix: MatrixSpec,
}

/// Numerical knobs of the estimator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EstimatorSettings {
    /// Relative pivot threshold below which a matrix counts as singular.
    pub singular_tolerance: f64,
    /// Smallest usable predicted mode probability / likelihood normalizer.
    pub probability_epsilon: f64,
    /// Allowed deviation of Markov rows and mode probabilities from 1.
    pub stochastic_tolerance: f64,
    /// Relative tolerance of the symmetry / PSD checks on `Q` and `R`.
    pub symmetry_tolerance: f64,
    /// Run per-model predict/update on the rayon pool.
    pub parallel_models: bool,
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self {
            singular_tolerance: 1e-12,
            probability_epsilon: 1e-300,
            stochastic_tolerance: 1e-9,
            symmetry_tolerance: 1e-9,
            parallel_models: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImmConfig {
    #[serde(default)]
    pub parameters: BTreeMap<String, f64>,
    /// Labels of the fused state, in order.
    pub state_vector: Vec<String>,
    pub models: Vec<ModelConfig>,
    pub markov_transition_matrix: MatrixSpec,
    pub mode_probabilities: Vec<EntrySpec>,
    /// Projection for models whose native dimension is below the fused one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<ProjectionConfig>,
    pub covariance_expansion: CovarianceExpansion,
    #[serde(default)]
    pub settings: EstimatorSettings,
}

// ---------------------------------------------------------------------------
// Compiled model set
// ---------------------------------------------------------------------------

/// Validated, immutable bank description.
#[derive(Clone, Debug)]
pub struct ModelSet {
    labels: Vec<String>,
    models: Vec<Arc<LinearModel>>,
    adapter: SpaceAdapter,
    transition: DMat,
    initial_probabilities: DVec,
    covariance_expansion: CovarianceExpansion,
    settings: EstimatorSettings,
}

impl ModelSet {
    pub fn from_json_str(json: &str) -> ImmResult<Self> {
        let config: ImmConfig = serde_json::from_str(json)
            .map_err(|e| ImmError::config(format!("invalid configuration JSON: {e}")))?;
        Self::from_config(&config)
    }

    pub fn load(path: impl AsRef<Path>) -> ImmResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ImmError::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn from_config(config: &ImmConfig) -> ImmResult<Self> {
        let settings = validate_settings(&config.settings)?;
        let params = validate_parameters(&config.parameters)?;
        let labels = validate_labels(&config.state_vector)?;
        let fused = labels.len();

        let k = config.models.len();
        if k == 0 {
            return Err(ImmError::config("no models configured"));
        }

        let global_projection = config
            .projection
            .as_ref()
            .map(|p| compile_projection(p, &params, "global projection"))
            .transpose()?;

        let mut models = Vec::with_capacity(k);
        let mut projections = Vec::with_capacity(k);
        for mc in &config.models {
            if mc.name.trim().is_empty() {
                return Err(ImmError::config("model with an empty name"));
            }
            if models.iter().any(|m: &Arc<LinearModel>| m.name() == mc.name) {
                return Err(ImmError::config(format!("duplicate model name '{}'", mc.name)));
            }
            let model = compile_model(mc, &params, &settings)?;
            let n = model.dim();
            if n > fused {
                return Err(ImmError::config(format!(
                    "model '{}' has {n} states but the fused state has {fused}",
                    mc.name
                )));
            }

            let projection = if n == fused {
                None
            } else {
                let own = mc
                    .projection
                    .as_ref()
                    .map(|p| compile_projection(p, &params, &format!("projection of model '{}'", mc.name)))
                    .transpose()?;
                let projection = own.or_else(|| global_projection.clone()).ok_or_else(|| {
                    ImmError::config(format!(
                        "model '{}' has {n} states but no projection into the fused {fused}",
                        mc.name
                    ))
                })?;
                if projection.fused_dim() != fused || projection.native_dim() != n {
                    return Err(ImmError::config(format!(
                        "projection for model '{}' maps {} -> {}, expected {n} -> {fused}",
                        mc.name,
                        projection.native_dim(),
                        projection.fused_dim()
                    )));
                }
                Some(projection)
            };

            models.push(Arc::new(model));
            projections.push(projection);
        }

        let adapter = SpaceAdapter::new(fused, projections)
            .map_err(|e| ImmError::config(e.to_string()))?;

        let transition = constant_matrix(
            &config.markov_transition_matrix,
            &params,
            "markov_transition_matrix",
        )?;
        if transition.nrows() != k || transition.ncols() != k {
            return Err(ImmError::config(format!(
                "markov_transition_matrix must be {k}x{k}, got {}x{}",
                transition.nrows(),
                transition.ncols()
            )));
        }
        for (i, row) in transition.row_iter().enumerate() {
            check_distribution(
                row.iter().copied(),
                settings.stochastic_tolerance,
                &format!("markov_transition_matrix row {i}"),
            )?;
        }

        let initial_probabilities = config
            .mode_probabilities
            .iter()
            .map(|e| constant_entry(e, &params, "mode_probabilities"))
            .collect::<ImmResult<Vec<f64>>>()?;
        if initial_probabilities.len() != k {
            return Err(ImmError::config(format!(
                "{} mode probabilities for {k} models",
                initial_probabilities.len()
            )));
        }
        check_distribution(
            initial_probabilities.iter().copied(),
            settings.stochastic_tolerance,
            "mode_probabilities",
        )?;

        info!(
            models = k,
            fused_dim = fused,
            expansion = ?config.covariance_expansion,
            "loaded IMM configuration"
        );

        Ok(Self {
            labels,
            models,
            adapter,
            transition,
            initial_probabilities: DVec::from_vec(initial_probabilities),
            covariance_expansion: config.covariance_expansion,
            settings,
        })
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// `N`
    pub fn fused_dim(&self) -> usize {
        self.labels.len()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn models(&self) -> &[Arc<LinearModel>] {
        &self.models
    }

    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(|m| m.name())
    }

    pub fn adapter(&self) -> &SpaceAdapter {
        &self.adapter
    }

    pub fn transition(&self) -> &DMat {
        &self.transition
    }

    pub fn initial_probabilities(&self) -> &DVec {
        &self.initial_probabilities
    }

    pub fn covariance_expansion(&self) -> CovarianceExpansion {
        self.covariance_expansion
    }

    pub fn settings(&self) -> &EstimatorSettings {
        &self.settings
    }

    /// Fresh tracker at the configured initial probabilities.
    pub fn mode_tracker(&self) -> ImmResult<ModeProbabilities> {
        ModeProbabilities::new(
            self.transition.clone(),
            self.initial_probabilities.clone(),
            self.settings.probability_epsilon,
        )
    }

    pub fn state_index(&self, label: &str) -> ImmResult<usize> {
        self.labels
            .iter()
            .position(|l| l == label)
            .ok_or_else(|| ImmError::UnknownLabel(label.to_string()))
    }

    /// Fused vector with the given labelled components; the rest are zero.
    pub fn state_from_labels(&self, values: &[(&str, f64)]) -> ImmResult<DVec> {
        let mut x = DVec::zeros(self.fused_dim());
        for (label, v) in values {
            x[self.state_index(label)?] = *v;
        }
        Ok(x)
    }

    /// Measurement laid out over the fused labels, for configurations whose
    /// observation matrices have one row per fused label.
    pub fn labeled_measurement(&self, values: &[(&str, f64)]) -> ImmResult<Measurement> {
        let fused = self.fused_dim();
        if let Some(m) = self.models.iter().find(|m| m.measurement_dim() != fused) {
            return Err(ImmError::mismatch(
                format!("observation rows of model '{}'", m.name()),
                fused,
                m.measurement_dim(),
            ));
        }
        Ok(Measurement::new(self.state_from_labels(values)?))
    }
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

fn validate_settings(s: &EstimatorSettings) -> ImmResult<EstimatorSettings> {
    for (name, v) in [
        ("singular_tolerance", s.singular_tolerance),
        ("probability_epsilon", s.probability_epsilon),
        ("stochastic_tolerance", s.stochastic_tolerance),
        ("symmetry_tolerance", s.symmetry_tolerance),
    ] {
        if !v.is_finite() || v < 0.0 {
            return Err(ImmError::config(format!("setting {name} must be finite and >= 0, got {v}")));
        }
    }
    Ok(s.clone())
}

fn validate_parameters(params: &BTreeMap<String, f64>) -> ImmResult<BTreeMap<String, f64>> {
    for (name, v) in params {
        if name == TIME_STEP {
            return Err(ImmError::config(format!("parameter name '{TIME_STEP}' is reserved")));
        }
        if !v.is_finite() {
            return Err(ImmError::config(format!("parameter '{name}' is not finite")));
        }
    }
    Ok(params.clone())
}

fn validate_labels(labels: &[String]) -> ImmResult<Vec<String>> {
    if labels.is_empty() {
        return Err(ImmError::config("state_vector is empty"));
    }
    for (i, l) in labels.iter().enumerate() {
        if l.trim().is_empty() {
            return Err(ImmError::config(format!("state_vector label {i} is empty")));
        }
        if labels[..i].contains(l) {
            return Err(ImmError::config(format!("duplicate state label '{l}'")));
        }
    }
    Ok(labels.to_vec())
}

fn compile_entry(spec: &EntrySpec, params: &BTreeMap<String, f64>, what: &str) -> ImmResult<Entry> {
    match spec {
        EntrySpec::Number(v) if v.is_finite() => Ok(Entry::Constant(*v)),
        EntrySpec::Number(v) => Err(ImmError::config(format!("{what}: entry {v} is not finite"))),
        EntrySpec::Expr(src) => {
            let expr = Expr::parse(src).map_err(|e| ImmError::config(format!("{what}: {e}")))?;
            Ok(Entry::bound(&expr, params))
        }
    }
}

/// Only `dt` may remain free once parameters are bound.
fn check_free_variables(variables: BTreeSet<String>, what: &str) -> ImmResult<()> {
    match variables.into_iter().find(|v| v != TIME_STEP) {
        Some(unknown) => Err(ImmError::config(format!("{what}: unknown variable '{unknown}'"))),
        None => Ok(()),
    }
}

fn compile_matrix(spec: &MatrixSpec, params: &BTreeMap<String, f64>, what: &str) -> ImmResult<MatrixFormula> {
    let rows = spec.len();
    let cols = spec.first().map_or(0, Vec::len);
    if rows == 0 || cols == 0 {
        return Err(ImmError::config(format!("{what} is empty")));
    }
    if let Some(i) = spec.iter().position(|r| r.len() != cols) {
        return Err(ImmError::config(format!(
            "{what} is not rectangular: row {i} has {} entries, expected {cols}",
            spec[i].len()
        )));
    }
    let entries = spec
        .iter()
        .flatten()
        .map(|e| compile_entry(e, params, what))
        .collect::<ImmResult<Vec<Entry>>>()?;
    let formula = MatrixFormula::new(rows, cols, entries)?;
    check_free_variables(formula.free_variables(), what)?;
    Ok(formula)
}

fn constant_entry(spec: &EntrySpec, params: &BTreeMap<String, f64>, what: &str) -> ImmResult<f64> {
    match compile_entry(spec, params, what)? {
        Entry::Constant(v) if v.is_finite() => Ok(v),
        Entry::Constant(v) => Err(ImmError::config(format!("{what}: entry evaluates to {v}"))),
        Entry::Formula(f) => {
            check_free_variables(f.variables(), what)?;
            Err(ImmError::config(format!("{what} must not depend on {TIME_STEP}")))
        }
    }
}

fn constant_matrix(spec: &MatrixSpec, params: &BTreeMap<String, f64>, what: &str) -> ImmResult<DMat> {
    let formula = compile_matrix(spec, params, what)?;
    if !formula.is_constant() {
        return Err(ImmError::config(format!("{what} must not depend on {TIME_STEP}")));
    }
    formula.evaluate(0.0)
}

fn check_distribution(values: impl Iterator<Item = f64>, tol: f64, what: &str) -> ImmResult<()> {
    let mut sum = 0.0;
    for v in values {
        if !(-tol..=1.0 + tol).contains(&v) {
            return Err(ImmError::config(format!("{what}: probability {v} outside [0, 1]")));
        }
        sum += v;
    }
    if (sum - 1.0).abs() > tol {
        return Err(ImmError::config(format!("{what} sums to {sum}, expected 1")));
    }
    Ok(())
}

fn compile_model(
    mc: &ModelConfig,
    params: &BTreeMap<String, f64>,
    settings: &EstimatorSettings,
) -> ImmResult<LinearModel> {
    let name = &mc.name;
    if mc.filter_type != FilterType::KalmanFilter {
        return Err(ImmError::config(format!(
            "model '{name}': filter type {:?} is not linear-Gaussian",
            mc.filter_type
        )));
    }
    let what = |m: &str| format!("model '{name}': {m}");

    let model = LinearModel::new(
        name.clone(),
        mc.filter_type,
        compile_matrix(&mc.transition_matrix, params, &what("transition_matrix"))?,
        compile_matrix(&mc.process_noise_matrix, params, &what("process_noise_matrix"))?,
        compile_matrix(&mc.measurement_control_matrix, params, &what("measurement_control_matrix"))?,
        compile_matrix(&mc.measurement_uncertainty_matrix, params, &what("measurement_uncertainty_matrix"))?,
        compile_matrix(&mc.input_control_matrix, params, &what("input_control_matrix"))?,
    )?
    .with_singular_tolerance(settings.singular_tolerance);

    for (matrix, formula) in model.formulas() {
        let time_varying = matches!(matrix, "transition_matrix" | "process_noise_matrix");
        if !time_varying && !formula.is_constant() {
            return Err(ImmError::config(format!(
                "model '{name}': {matrix} must not depend on {TIME_STEP}"
            )));
        }
    }

    let check_psd = |matrix: &str, dt: f64, m: &DMat| {
        if is_symmetric_psd(m, settings.symmetry_tolerance) {
            return Ok(());
        }
        Err(ImmError::config(format!(
            "model '{name}': {matrix} is not symmetric positive semi-definite at dt={dt} \
             (min eigenvalue {:e})",
            min_eigenvalue(m)
        )))
    };
    for dt in SAMPLE_TIME_STEPS {
        check_psd("process_noise_matrix", dt, &model.process_noise(dt)?)?;
    }
    check_psd("measurement_uncertainty_matrix", 0.0, &model.measurement_noise()?)?;

    Ok(model)
}

fn compile_projection(
    pc: &ProjectionConfig,
    params: &BTreeMap<String, f64>,
    what: &str,
) -> ImmResult<Projection> {
    let m = |spec: &MatrixSpec, name: &str| constant_matrix(spec, params, &format!("{what}: {name}"));
    Projection::new(
        m(&pc.expansion_matrix, "expansion_matrix")?,
        m(&pc.expansion_matrix_covariance, "expansion_matrix_covariance")?,
        m(&pc.expansion_matrix_s, "expansion_matrix_s")?,
        m(&pc.shrinking_matrix, "shrinking_matrix")?,
    )
    .map_err(|e| ImmError::config(format!("{what}: {e}")))
}
