//! Trained linear-model constants.
//!
//! One weight per power-spectrum bin, in bin order starting at DC. The
//! values are part of the device protocol contract and must not be
//! re-derived or rounded.

/// Weights over the first 45 spectrum bins of a 178-point window.
pub const WEIGHTS: [f64; 45] = [
    0.00041527318645310762,
    0.00021067391402378823,
    0.00014410373861528906,
    0.00011013249890866709,
    0.00008904919528130991,
    0.00006847482391922754,
    0.00005310726814873267,
    0.00004019204991730118,
    0.00003151794926245136,
    0.00002404794114027611,
    0.00001790593128201473,
    0.00001274806297085113,
    0.00000851648907332781,
    0.00000463172936724809,
    0.00000148032145860489,
    -0.00000117524903582916,
    -0.00000349712908116343,
    -0.00000561398472190035,
    -0.00000740518814876129,
    -0.00000897236520932154,
    -0.00001038641972909307,
    -0.00001159814307721368,
    -0.00001263407442618741,
    -0.00001355028985391262,
    -0.00001431709764871485,
    -0.00001497322492851208,
    -0.00001552791403728094,
    -0.00001598245601327816,
    -0.00001637091473829253,
    -0.00001668104427390318,
    -0.00001693728526474903,
    -0.00001713274829158211,
    -0.00001728516273940154,
    -0.00001739404710912385,
    -0.00001746859673250127,
    -0.00001751192546348909,
    -0.00001752974251809823,
    -0.00001752480975301264,
    -0.00001750023439128657,
    -0.00001745824508272019,
    -0.00001740127394482516,
    -0.00001733072561327948,
    -0.00001724836517729135,
    -0.00001715560192843247,
    -0.00001705371026489352,
];

/// Decision-function intercept.
pub const INTERCEPT: f64 = -4.204528957411403;
