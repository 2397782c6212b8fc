use tch::{TchError, Tensor};

/// `dy/dr` for a column `y` computed pointwise from the column `r`.
///
/// Differentiating `sum(y)` equals seeding autograd with ones. The graph is
/// kept and extended so the result can be differentiated again, both with
/// respect to `r` and to the network parameters.
pub fn radial_derivative(y: &Tensor, r: &Tensor) -> Result<Tensor, TchError> {
    let mut grads = Tensor::f_run_backward(&[y.sum(y.kind())], &[r], true, true)?;
    Ok(grads.swap_remove(0))
}

/// Residual of the thin-plate bending equation on a foundation,
///
/// `w'''' + (2/r) w''' - (1/r^2) w'' + (1/r^3) w' + w + p/K - q/K`,
///
/// with `K` the flexural rigidity.
pub fn plate_residual(
    w: &Tensor,
    q: &Tensor,
    p: &Tensor,
    r: &Tensor,
    rigidity: f64,
) -> Result<Tensor, TchError> {
    let w_r = radial_derivative(w, r)?;
    let w_rr = radial_derivative(&w_r, r)?;
    let w_rrr = radial_derivative(&w_rr, r)?;
    let w_rrrr = radial_derivative(&w_rrr, r)?;

    let inv_r = r.reciprocal();
    let inv_r2 = &inv_r * &inv_r;
    let inv_r3 = &inv_r2 * &inv_r;

    Ok(w_rrrr + &inv_r * 2.0 * &w_rrr - inv_r2 * &w_rr + inv_r3 * &w_r + w + (p - q) / rigidity)
}
