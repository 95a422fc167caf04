use ndarray::{array, Array, Array2};
use pmkrig_gp::{SpaceTimeData, SpaceTimeGp, TimeAxis};

fn main() {
    // three sensors (planar x, planar y, elevation) reporting hourly for one day
    let space = array![[0., 0., 1300.], [1200., 300., 1310.], [400., 1500., 1290.]];
    let data = Array2::from_shape_fn((3, 24), |(s, t)| {
        12. + 4. * (2. * std::f64::consts::PI * t as f64 / 24.).sin() + s as f64
    });
    let dataset =
        SpaceTimeData::new(space, TimeAxis::regular(1., 24), data).expect("valid dataset");

    let gp = SpaceTimeGp::params(4300., 30., 2.)
        .fit(&dataset)
        .expect("GP fitting");
    println!("{gp}");

    let locations = array![[533., 600., 1300.]];
    let times = Array::linspace(6., 18., 13);
    let (mean, variance) = gp
        .predict_valvar(&locations, &times)
        .expect("GP prediction");
    for ((t, m), v) in times.iter().zip(mean.row(0)).zip(variance.row(0)) {
        println!("t={t:5.1}h  pm2.5={m:6.2}  var={v:.3}");
    }
}
