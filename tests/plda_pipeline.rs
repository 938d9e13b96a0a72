//! Scoring-pipeline laws on a synthetic PLDA model: batched/looped
//! equivalence, AS-Norm symmetry, and the degenerate-cohort clamp.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use voicegate::embedding::l2_normalize;
use voicegate::plda::{as_norm, cohort_stats, PldaModel, PldaScorer};

const DIM: usize = 32;
const SUBSPACE: usize = 12;

fn synthetic_model(seed: u64) -> PldaModel {
    let mut rng = StdRng::seed_from_u64(seed);
    let mean: Vec<f64> = (0..DIM).map(|_| rng.gen_range(-0.05..0.05)).collect();
    let f: Vec<Vec<f64>> = (0..DIM)
        .map(|_| (0..SUBSPACE).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect();

    let a: Vec<Vec<f64>> = (0..DIM)
        .map(|_| (0..DIM).map(|_| rng.gen_range(-0.5..0.5)).collect())
        .collect();
    let mut sigma = vec![vec![0.0; DIM]; DIM];
    for i in 0..DIM {
        for j in 0..DIM {
            let dot: f64 = a[i].iter().zip(a[j].iter()).map(|(x, y)| x * y).sum();
            sigma[i][j] = dot + if i == j { DIM as f64 } else { 0.0 };
        }
    }

    PldaModel::from_parts(mean, f, sigma, 1.0).unwrap()
}

fn embedding(rng: &mut StdRng) -> Vec<f32> {
    let mut v: Vec<f32> = (0..DIM).map(|_| rng.gen_range(-1.0..1.0)).collect();
    l2_normalize(&mut v);
    v
}

#[test]
fn batched_cohort_scoring_matches_looped_scoring() {
    let scorer = PldaScorer::new(&synthetic_model(97)).unwrap();
    let mut rng = StdRng::seed_from_u64(11);

    let enroll = embedding(&mut rng);
    let test = embedding(&mut rng);
    let cohort: Vec<Vec<f32>> = (0..30).map(|_| embedding(&mut rng)).collect();

    for reference in [&enroll, &test] {
        let batched = scorer.cohort_scores(reference, &cohort).unwrap();
        for (i, cohort_vector) in cohort.iter().enumerate() {
            let single = scorer.score(reference, cohort_vector).unwrap();
            let denom = single.abs().max(1e-12);
            assert!(
                ((batched[i] - single) / denom).abs() < 1e-4,
                "relative error too large at {}: batched {} vs single {}",
                i,
                batched[i],
                single
            );
        }
    }
}

#[test]
fn full_as_norm_pipeline_is_symmetric_in_enroll_and_test() {
    let scorer = PldaScorer::new(&synthetic_model(5)).unwrap();
    let mut rng = StdRng::seed_from_u64(23);

    let enroll = embedding(&mut rng);
    let test = embedding(&mut rng);
    let cohort_enroll: Vec<Vec<f32>> = (0..20).map(|_| embedding(&mut rng)).collect();
    let cohort_test: Vec<Vec<f32>> = (0..20).map(|_| embedding(&mut rng)).collect();

    let raw_forward = scorer.score(&enroll, &test).unwrap();
    let raw_backward = scorer.score(&test, &enroll).unwrap();
    assert!((raw_forward - raw_backward).abs() < 1e-9);

    let scores_enroll = scorer.cohort_scores(&enroll, &cohort_enroll).unwrap();
    let scores_test = scorer.cohort_scores(&test, &cohort_test).unwrap();

    let forward = as_norm(raw_forward, &scores_enroll, &scores_test);
    let backward = as_norm(raw_backward, &scores_test, &scores_enroll);
    assert!((forward - backward).abs() < 1e-9);
}

#[test]
fn identical_centroids_produce_identical_scores() {
    // Enrolling twice with the same audio yields the same centroid, which
    // must score identically against any probe.
    let scorer = PldaScorer::new(&synthetic_model(41)).unwrap();
    let mut rng = StdRng::seed_from_u64(3);

    let centroid_a = embedding(&mut rng);
    let centroid_b = centroid_a.clone();
    let probe = embedding(&mut rng);

    let score_a = scorer.score(&centroid_a, &probe).unwrap();
    let score_b = scorer.score(&centroid_b, &probe).unwrap();
    assert_eq!(score_a, score_b);
}

#[test]
fn degenerate_cohort_is_clamped_not_divided_by_zero() {
    let scores = vec![1.5f64; 16];
    let (_, sigma) = cohort_stats(&scores);
    assert!(sigma >= 1e-8);

    let z = as_norm(1.5, &scores, &scores);
    assert!(z.is_finite());
}

/// The fast cached-decomposition path must agree with the textbook
/// two-covariance likelihood ratio evaluated directly:
///
/// same-speaker hypothesis:   x = [e; t] ~ N(mu2, [[S, B], [B, S]])
/// different-speaker:         x = [e; t] ~ N(mu2, [[S, 0], [0, S]])
///
/// with S the total covariance F F' + Sigma and B the between-speaker
/// covariance F F'.
#[test]
fn fast_scoring_matches_direct_joint_gaussian_llr() {
    use nalgebra::{Cholesky, DMatrix, DVector};

    let model = synthetic_model(77);
    let scorer = PldaScorer::new(&model).unwrap();
    let mut rng = StdRng::seed_from_u64(8);

    let between = &model.f * model.f.transpose();
    let total = &between + &model.sigma;

    // Joint covariances over the stacked [enroll; test] vector.
    let mut same = DMatrix::<f64>::zeros(2 * DIM, 2 * DIM);
    let mut diff = DMatrix::<f64>::zeros(2 * DIM, 2 * DIM);
    for i in 0..DIM {
        for j in 0..DIM {
            same[(i, j)] = total[(i, j)];
            same[(DIM + i, DIM + j)] = total[(i, j)];
            same[(i, DIM + j)] = between[(i, j)];
            same[(DIM + i, j)] = between[(i, j)];
            diff[(i, j)] = total[(i, j)];
            diff[(DIM + i, DIM + j)] = total[(i, j)];
        }
    }

    let log_gaussian = |cov: &DMatrix<f64>, x: &DVector<f64>| -> f64 {
        let chol = Cholesky::new(cov.clone()).unwrap();
        let log_det = 2.0 * chol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>();
        let quad = x.dot(&chol.solve(x));
        -0.5 * (log_det + quad)
    };

    for _ in 0..5 {
        let enroll = embedding(&mut rng);
        let test = embedding(&mut rng);

        let centered: Vec<f64> = enroll
            .iter()
            .chain(test.iter())
            .enumerate()
            .map(|(i, &v)| v as f64 - model.mean[i % DIM])
            .collect();
        let x = DVector::from_vec(centered);

        let direct = log_gaussian(&same, &x) - log_gaussian(&diff, &x);
        let fast = scorer.score(&enroll, &test).unwrap();
        assert!(
            (fast - direct).abs() < 1e-8,
            "fast {} vs direct {}",
            fast,
            direct
        );
    }
}
