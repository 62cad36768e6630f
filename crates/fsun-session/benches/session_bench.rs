use criterion::{Criterion, criterion_group, criterion_main};
use fsun_session::{Iter, LinearSolverSpec, Lmm, PrecType, Session, SessionConfig};

fn bdf_dense() -> SessionConfig {
    SessionConfig {
        lmm: Lmm::Bdf,
        iter: Iter::Newton(LinearSolverSpec::Dense),
    }
}

fn bench_advance_decay_dense(c: &mut Criterion) {
    c.bench_function("advance_decay_bdf_dense", |b| {
        b.iter(|| {
            let session = Session::init(bdf_dense(), 0.0, &[1.0], |_t, y, mut ydot| {
                ydot.set(0, -y.get(0));
                Ok(())
            })
            .expect("session init");
            let mut yout = [0.0];
            session.advance_normal(1.0, &mut yout).expect("advance");
            yout[0]
        });
    });
}

fn bench_advance_lorenz_with_jacobian(c: &mut Criterion) {
    let (sigma, rho, beta) = (10.0, 28.0, 8.0 / 3.0);
    c.bench_function("advance_lorenz_bdf_dense_jac", |b| {
        b.iter(|| {
            let session = Session::init(
                bdf_dense(),
                0.0,
                &[1.0, 1.0, 1.0],
                move |_t, y, mut ydot| {
                    let (x, yy, z) = (y.get(0), y.get(1), y.get(2));
                    ydot.set(0, sigma * (yy - x));
                    ydot.set(1, x * (rho - z) - yy);
                    ydot.set(2, x * yy - beta * z);
                    Ok(())
                },
            )
            .expect("session init");
            session.set_max_num_steps(100_000).expect("budget");
            session
                .set_dense_jac_fn(move |arg, jac| {
                    let (x, yy, z) = (arg.y.get(0), arg.y.get(1), arg.y.get(2));
                    jac.set(0, 0, -sigma);
                    jac.set(0, 1, sigma);
                    jac.set(0, 2, 0.0);
                    jac.set(1, 0, rho - z);
                    jac.set(1, 1, -1.0);
                    jac.set(1, 2, -x);
                    jac.set(2, 0, yy);
                    jac.set(2, 1, x);
                    jac.set(2, 2, -beta);
                    Ok(())
                })
                .expect("jacobian");
            let mut yout = [0.0; 3];
            session.advance_normal(0.5, &mut yout).expect("advance");
            yout[0]
        });
    });
}

fn bench_advance_heat_krylov(c: &mut Criterion) {
    const N: usize = 32;
    c.bench_function("advance_heat_bdf_krylov", |b| {
        b.iter(|| {
            let config = SessionConfig {
                lmm: Lmm::Bdf,
                iter: Iter::Newton(LinearSolverSpec::Krylov {
                    pretype: PrecType::None,
                    maxl: 5,
                }),
            };
            let y0 = vec![1.0; N];
            let session = Session::init(config, 0.0, &y0, |_t, y, mut ydot| {
                for i in 0..N {
                    let left = if i == 0 { 0.0 } else { y.get(i - 1) };
                    let right = if i == N - 1 { 0.0 } else { y.get(i + 1) };
                    ydot.set(i, left - 2.0 * y.get(i) + right);
                }
                Ok(())
            })
            .expect("session init");
            session.set_max_num_steps(100_000).expect("budget");
            let mut yout = vec![0.0; N];
            session.advance_normal(0.25, &mut yout).expect("advance");
            yout[0]
        });
    });
}

criterion_group!(
    benches,
    bench_advance_decay_dense,
    bench_advance_lorenz_with_jacobian,
    bench_advance_heat_krylov
);
criterion_main!(benches);
