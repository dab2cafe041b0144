//! Pose Graph Optimization over odometry and loop-closure edges.
//!
//! Nodes are keyframe poses (T_wc as Sim3; scale fixed to 1 unless
//! configured otherwise), edges are relative-pose constraints. Odometry
//! edges act as a soft prior, loop edges carry a much larger information
//! weight.
//!
//! This module uses the three-phase pattern:
//! 1. COLLECT: Extract poses and edges from the map (read lock)
//! 2. SOLVE: Run LM optimization without locks
//! 3. APPLY: Write back optimized poses in one batch (write lock)

use std::collections::{BTreeMap, BTreeSet, HashMap};

use nalgebra::{DMatrix, DVector, SMatrix, SVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::atlas::map::{KeyFrameId, Map, PoseGraphEdge};
use crate::error::{Result, SlamError};
use crate::geometry::Sim3;

/// Configuration for pose graph optimization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseGraphConfig {
    /// Maximum number of LM iterations.
    /// Default: 20
    pub max_iterations: usize,

    /// Convergence threshold on parameter change.
    /// Default: 1e-9
    pub param_tolerance: f64,

    /// Convergence threshold on gradient norm.
    /// Default: 1e-9
    pub gradient_tolerance: f64,

    /// Whether to fix scale (true for metric depth or inertial sessions).
    /// Default: true
    pub fix_scale: bool,

    /// Keyframes optimized by the incremental (local) run.
    /// Default: 10
    pub local_window: usize,

    /// Information weight of loop-closure edges.
    /// Default: 100.0
    pub loop_information: f64,
}

impl Default for PoseGraphConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            param_tolerance: 1e-9,
            gradient_tolerance: 1e-9,
            fix_scale: true,
            local_window: 10,
            loop_information: 100.0,
        }
    }
}

impl PoseGraphConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(SlamError::Config("pose_graph.max_iterations must be positive".into()));
        }
        if self.local_window < 2 {
            return Err(SlamError::Config("pose_graph.local_window must be at least 2".into()));
        }
        if self.loop_information <= 0.0 {
            return Err(SlamError::Config("pose_graph.loop_information must be positive".into()));
        }
        Ok(())
    }
}

/// Data extracted for pose graph optimization.
#[derive(Debug, Clone)]
pub struct PoseGraphProblem {
    /// Keyframe IDs in optimization order.
    pub kf_ids: Vec<KeyFrameId>,

    /// Initial Sim3 poses for each keyframe.
    pub initial_poses: BTreeMap<KeyFrameId, Sim3>,

    pub edges: Vec<PoseGraphEdge>,

    /// Nodes held constant (at least one).
    pub fixed: BTreeSet<KeyFrameId>,

    pub fix_scale: bool,

    /// Map generation at collection time.
    pub generation: u64,
}

/// Result of pose graph optimization.
#[derive(Debug, Clone)]
pub struct PoseGraphResult {
    /// Optimized Sim3 poses of every node (fixed ones unchanged).
    pub optimized_poses: BTreeMap<KeyFrameId, Sim3>,

    /// Poses the optimization started from.
    pub initial_poses: BTreeMap<KeyFrameId, Sim3>,

    pub iterations: usize,

    pub initial_error: f64,

    pub final_error: f64,

    pub generation: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// PHASE 1: Collect
// ─────────────────────────────────────────────────────────────────────────────

/// Every keyframe and edge; the oldest keyframe anchors the gauge.
pub fn collect_global(map: &Map, config: &PoseGraphConfig) -> Option<PoseGraphProblem> {
    let first = *map.keyframe_ids().next()?;
    let kf_ids: Vec<KeyFrameId> = map.keyframe_ids().copied().collect();
    let initial_poses = kf_ids
        .iter()
        .filter_map(|id| map.get_keyframe(*id).map(|kf| (*id, Sim3::from_se3(&kf.pose))))
        .collect();
    Some(PoseGraphProblem {
        kf_ids,
        initial_poses,
        edges: map.edges().to_vec(),
        fixed: BTreeSet::from([first]),
        fix_scale: config.fix_scale,
        generation: map.generation(),
    })
}

/// The most recent `local_window` keyframes up to `kf_id`, plus every
/// keyframe linked to them by an edge. Keyframes outside the window are
/// fixed.
pub fn collect_local(map: &Map, kf_id: KeyFrameId, config: &PoseGraphConfig) -> Option<PoseGraphProblem> {
    let upto: Vec<KeyFrameId> = map.keyframe_ids().copied().filter(|id| *id <= kf_id).collect();
    let window: BTreeSet<KeyFrameId> = upto.iter().rev().take(config.local_window).copied().collect();
    if window.len() < 2 {
        return None;
    }

    let edges: Vec<PoseGraphEdge> = map
        .edges()
        .iter()
        .filter(|e| window.contains(&e.kf_id_i) || window.contains(&e.kf_id_j))
        .cloned()
        .collect();
    let mut nodes: BTreeSet<KeyFrameId> = window.clone();
    for e in &edges {
        nodes.insert(e.kf_id_i);
        nodes.insert(e.kf_id_j);
    }
    let mut fixed: BTreeSet<KeyFrameId> = nodes.difference(&window).copied().collect();
    if fixed.is_empty() {
        fixed.insert(*window.iter().next()?);
    }

    let initial_poses = nodes
        .iter()
        .filter_map(|id| map.get_keyframe(*id).map(|kf| (*id, Sim3::from_se3(&kf.pose))))
        .collect();
    Some(PoseGraphProblem {
        kf_ids: nodes.into_iter().collect(),
        initial_poses,
        edges,
        fixed,
        fix_scale: config.fix_scale,
        generation: map.generation(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// PHASE 2: Solve
// ─────────────────────────────────────────────────────────────────────────────

const MAX_DOF: usize = 7;
type Block = SMatrix<f64, MAX_DOF, MAX_DOF>;
type Residual = SVector<f64, MAX_DOF>;

/// Solve the pose graph with LM.
///
/// Returns `None` when there is nothing to optimize: fewer than two nodes,
/// no free node, or the graph is already consistent.
pub fn solve(
    problem: &PoseGraphProblem,
    config: &PoseGraphConfig,
    should_stop: &dyn Fn() -> bool,
) -> Option<PoseGraphResult> {
    let dof = if problem.fix_scale { 6 } else { 7 };

    let free: Vec<KeyFrameId> = problem
        .kf_ids
        .iter()
        .filter(|id| !problem.fixed.contains(id))
        .copied()
        .collect();
    if problem.kf_ids.len() < 2 || free.is_empty() {
        return None;
    }
    let slot: HashMap<KeyFrameId, usize> = free.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let edges: Vec<&PoseGraphEdge> = problem
        .edges
        .iter()
        .filter(|e| problem.initial_poses.contains_key(&e.kf_id_i) && problem.initial_poses.contains_key(&e.kf_id_j))
        .collect();

    let mut poses: BTreeMap<KeyFrameId, Sim3> = problem.initial_poses.clone();
    let initial_error = total_error(&poses, &edges, dof);
    if initial_error < 1e-18 {
        return None;
    }

    let n_params = free.len() * dof;
    let mut current_error = initial_error;
    let mut lambda = 1e-4;
    let mut iterations = 0;

    for iter in 0..config.max_iterations {
        if should_stop() {
            break;
        }
        iterations = iter + 1;

        let mut h = DMatrix::<f64>::zeros(n_params, n_params);
        let mut g = DVector::<f64>::zeros(n_params);
        for edge in &edges {
            let (pi, pj) = (&poses[&edge.kf_id_i], &poses[&edge.kf_id_j]);
            let w = edge.information;
            let r = edge_residual(edge, pi, pj, dof);
            let ji = slot.get(&edge.kf_id_i).map(|_| numeric_jacobian(edge, pi, pj, dof, true));
            let jj = slot.get(&edge.kf_id_j).map(|_| numeric_jacobian(edge, pi, pj, dof, false));

            let blocks = [(edge.kf_id_i, ji), (edge.kf_id_j, jj)];
            for (a_id, ja) in &blocks {
                let (Some(a), Some(ja)) = (slot.get(a_id), ja) else {
                    continue;
                };
                let ga = ja.transpose() * r * w;
                for p in 0..dof {
                    g[a * dof + p] += ga[p];
                }
                for (b_id, jb) in &blocks {
                    let (Some(b), Some(jb)) = (slot.get(b_id), jb) else {
                        continue;
                    };
                    let hab = ja.transpose() * jb * w;
                    for p in 0..dof {
                        for q in 0..dof {
                            h[(a * dof + p, b * dof + q)] += hab[(p, q)];
                        }
                    }
                }
            }
        }

        if g.norm() < config.gradient_tolerance {
            break;
        }

        let mut damped = h.clone();
        for i in 0..n_params {
            damped[(i, i)] += lambda * h[(i, i)].max(1e-6);
        }
        let delta = match damped.clone().cholesky() {
            Some(chol) => chol.solve(&(-&g)),
            None => match damped.lu().solve(&(-&g)) {
                Some(d) => d,
                None => break,
            },
        };

        let trial = retract(&poses, &free, &delta, dof);
        let trial_error = total_error(&trial, &edges, dof);
        if trial_error < current_error {
            poses = trial;
            current_error = trial_error;
            lambda = (lambda * 0.1).max(1e-12);
            if delta.norm() < config.param_tolerance {
                break;
            }
        } else {
            lambda = (lambda * 10.0).min(1e10);
        }
    }

    debug!(
        "pose graph: {} nodes, {} edges, error {:.3e} -> {:.3e} in {} iterations",
        problem.kf_ids.len(),
        edges.len(),
        initial_error,
        current_error,
        iterations
    );
    Some(PoseGraphResult {
        optimized_poses: poses,
        initial_poses: problem.initial_poses.clone(),
        iterations,
        initial_error: initial_error.sqrt(),
        final_error: current_error.sqrt(),
        generation: problem.generation,
    })
}

/// Weighted residual: log(Z⁻¹ · T_i⁻¹ · T_j).
fn edge_residual(edge: &PoseGraphEdge, pose_i: &Sim3, pose_j: &Sim3, dof: usize) -> Residual {
    let predicted = pose_i.inverse().compose(pose_j);
    let err = edge.measurement.inverse().compose(&predicted).log();
    let mut r = Residual::zeros();
    for k in 0..dof {
        r[k] = err[k];
    }
    r
}

fn total_error(poses: &BTreeMap<KeyFrameId, Sim3>, edges: &[&PoseGraphEdge], dof: usize) -> f64 {
    edges
        .iter()
        .map(|e| edge_residual(e, &poses[&e.kf_id_i], &poses[&e.kf_id_j], dof).norm_squared() * e.information)
        .sum()
}

/// Left perturbation of a pose: exp(δ) · T.
fn perturb(pose: &Sim3, delta: &[f64; 7]) -> Sim3 {
    Sim3::exp(delta).compose(pose)
}

/// Central-difference Jacobian of the residual with respect to the left
/// perturbation of endpoint i (or j).
fn numeric_jacobian(edge: &PoseGraphEdge, pose_i: &Sim3, pose_j: &Sim3, dof: usize, wrt_i: bool) -> Block {
    const EPS: f64 = 1e-6;
    let mut j = Block::zeros();
    for p in 0..dof {
        let mut d = [0.0; 7];
        d[p] = EPS;
        let plus = perturb(if wrt_i { pose_i } else { pose_j }, &d);
        d[p] = -EPS;
        let minus = perturb(if wrt_i { pose_i } else { pose_j }, &d);
        let (r_plus, r_minus) = if wrt_i {
            (edge_residual(edge, &plus, pose_j, dof), edge_residual(edge, &minus, pose_j, dof))
        } else {
            (edge_residual(edge, pose_i, &plus, dof), edge_residual(edge, pose_i, &minus, dof))
        };
        let col = (r_plus - r_minus) / (2.0 * EPS);
        j.set_column(p, &col);
    }
    j
}

fn retract(poses: &BTreeMap<KeyFrameId, Sim3>, free: &[KeyFrameId], delta: &DVector<f64>, dof: usize) -> BTreeMap<KeyFrameId, Sim3> {
    let mut out = poses.clone();
    for (k, id) in free.iter().enumerate() {
        let mut d = [0.0; 7];
        for p in 0..dof {
            d[p] = delta[k * dof + p];
        }
        if let Some(pose) = out.get_mut(id) {
            *pose = perturb(pose, &d);
        }
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// PHASE 3: Apply
// ─────────────────────────────────────────────────────────────────────────────

/// Apply optimized poses to the map in one batch.
///
/// KeyFrames inserted after the snapshot receive the correction of their
/// nearest optimized predecessor. Landmarks move with their anchor. Returns
/// `None` without touching the map if another batch was applied since the
/// snapshot.
pub fn apply(map: &mut Map, result: &PoseGraphResult) -> Option<usize> {
    if map.generation() != result.generation {
        return None;
    }
    let mut batch: BTreeMap<KeyFrameId, Sim3> = BTreeMap::new();
    let mut last_correction: Option<Sim3> = None;
    let newest = result.optimized_poses.keys().next_back().copied();

    let ids: Vec<KeyFrameId> = map.keyframe_ids().copied().collect();
    for id in ids {
        if let (Some(new), Some(old)) = (result.optimized_poses.get(&id), result.initial_poses.get(&id)) {
            last_correction = Some(new.compose(&old.inverse()));
            batch.insert(id, new.clone());
        } else if newest.map_or(false, |n| id > n) {
            let (Some(correction), Some(kf)) = (&last_correction, map.get_keyframe(id)) else {
                continue;
            };
            batch.insert(id, correction.compose(&Sim3::from_se3(&kf.pose)));
        }
    }
    Some(map.apply_pose_batch(&batch))
}
