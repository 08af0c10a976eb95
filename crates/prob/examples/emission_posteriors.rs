//! Gaussian emission posteriors
//!
//! Run with: cargo run -p dmvflow-prob --example emission_posteriors
//!
//! Scores a handful of 2-D embeddings under three state Gaussians and turns
//! the scores into a posterior over states with a log-space softmax.

use dmvflow_diff::Tensor;
use dmvflow_prob::{argmax, log_softmax, log_sum_exp, EmissionModel};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Emission posteriors ===\n");

    let states = ["DET", "NOUN", "VERB"];
    let means = Tensor::from_rows(&[vec![-2.0, 0.0], vec![0.0, 1.5], vec![2.0, -1.0]], 2)?;
    let emission = EmissionModel::new(means, vec![0.5, 0.8])?;

    let points = [vec![-1.8, 0.2], vec![0.3, 1.1], vec![1.0, 0.0], vec![2.4, -1.3]];
    let x = Tensor::from_rows(&points, 2)?;
    let scores = emission.log_density(&x)?;
    let k = emission.num_states();

    for (i, point) in points.iter().enumerate() {
        let row = &scores.data[i * k..(i + 1) * k];
        let posterior: Vec<f64> = log_softmax(row).iter().map(|lp| lp.exp()).collect();
        let best = argmax(row).map(|(s, _)| states[s]).unwrap_or("-");
        println!(
            "  x = ({:>5.2}, {:>5.2})  p(x) = {:>8.4}  posterior = [{:.3}, {:.3}, {:.3}]  → {}",
            point[0],
            point[1],
            log_sum_exp(row) - (k as f64).ln(),
            posterior[0],
            posterior[1],
            posterior[2],
            best
        );
    }
    Ok(())
}
