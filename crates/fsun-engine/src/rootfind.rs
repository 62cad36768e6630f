#![forbid(unsafe_code)]

//! Root detection: after each accepted step, compare the root function's
//! signs at the step endpoints and refine the earliest crossing by
//! bisection on the interpolated solution.

use fsun_nvec::RealBuffer;
use fsun_runtime::UNIT_ROUNDOFF;

use crate::flags::ENG_WARNING;
use crate::mem::EngineMem;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum RootOutcome {
    None,
    Found(f64),
    Fail,
}

fn crosses(glo: f64, ghi: f64) -> bool {
    (glo < 0.0 && ghi >= 0.0) || (glo > 0.0 && ghi <= 0.0)
}

fn allowed(dir: i32, glo: f64, ghi: f64) -> bool {
    match dir {
        0 => true,
        d if d > 0 => glo < ghi,
        _ => glo > ghi,
    }
}

impl EngineMem {
    pub(crate) fn eval_roots(&mut self, t: f64, y: &RealBuffer, out: &mut [f64]) -> i32 {
        let Some(g) = self.roots_fn else {
            return -1;
        };
        self.nge += 1;
        let flag = g(t, y, &self.gbuf, self.user_data);
        if flag != 0 {
            return flag;
        }
        self.gbuf.copy_to(out);
        0
    }

    /// Called once per accepted step, with `[told, tn]` the step interval.
    pub(crate) fn check_roots(&mut self) -> RootOutcome {
        let n = self.nroots;
        let mut ghi = vec![0.0; n];
        let y = self.y.clone();
        if self.eval_roots(self.tn, &y, &mut ghi) != 0 {
            return RootOutcome::Fail;
        }
        let glo = self.glo.clone();
        let dirs = self.root_dirs.clone();

        let mut any_active = false;
        let mut any_masked = false;
        for i in 0..n {
            if crosses(glo[i], ghi[i]) {
                if allowed(dirs[i], glo[i], ghi[i]) {
                    any_active = true;
                } else {
                    any_masked = true;
                }
            }
        }
        if !any_active {
            if any_masked && !self.no_inactive_warn {
                self.report(
                    ENG_WARNING,
                    "check_roots",
                    "sign change filtered out by the configured root direction",
                );
            }
            self.glo = ghi;
            return RootOutcome::None;
        }

        // bisection for the earliest crossing
        let mut tlo = self.told;
        let mut thi = self.tn;
        let mut glo_v = glo.clone();
        let mut ghi_v = ghi.clone();
        let ttol = 100.0 * UNIT_ROUNDOFF * (self.tn.abs() + self.hlast.abs()).max(1.0);
        let mut gmid = vec![0.0; n];
        let ytmp = self.tmp1.clone();
        while (thi - tlo).abs() > ttol {
            let tmid = 0.5 * (tlo + thi);
            if tmid == tlo || tmid == thi {
                break;
            }
            self.interp_into_buffer(tmid, &ytmp);
            if self.eval_roots(tmid, &ytmp, &mut gmid) != 0 {
                return RootOutcome::Fail;
            }
            let low_half = (0..n)
                .any(|i| allowed(dirs[i], glo_v[i], gmid[i]) && crosses(glo_v[i], gmid[i]));
            if low_half {
                thi = tmid;
                ghi_v.copy_from_slice(&gmid);
            } else {
                tlo = tmid;
                glo_v.copy_from_slice(&gmid);
            }
        }
        let troot = thi;

        for i in 0..n {
            self.roots_found[i] = if allowed(dirs[i], glo[i], ghi_v[i]) && crosses(glo[i], ghi_v[i])
            {
                if ghi_v[i] >= glo[i] { 1 } else { -1 }
            } else {
                0
            };
        }
        // the integrator itself continues from tn; remember g there
        self.glo = ghi;
        RootOutcome::Found(troot)
    }
}
