use std::io;

use super::*;
use crate::hw::sim::{self, SimHardware};

fn fam17h() -> (SimHardware, Workarounds) {
    let hw = SimHardware::new(sim::ident(0x17, 0x01), 2);
    let flags = WorkaroundFlags {
        fam17h_m01h: true,
        ..WorkaroundFlags::default()
    };
    (hw, Workarounds::for_flags(&flags))
}

#[test]
fn test_for_flags() {
    assert!(Workarounds::for_flags(&WorkaroundFlags::default()).is_empty());

    let flags = WorkaroundFlags {
        fam10h_err_420: true,
        fam17h_m01h: true,
        ..WorkaroundFlags::default()
    };
    let errata: Vec<_> = Workarounds::for_flags(&flags).errata().collect();
    assert_eq!(errata, [Erratum::Fam10hErr420, Erratum::Fam17hM01h]);
}

#[test]
fn test_fam17h_m01h_online_is_idempotent() {
    let (hw, errata) = fam17h();
    hw.set_msr(0, FAM17H_M01H_ENABLE[0].0, 0x5);
    errata.install(&hw).unwrap();

    assert_eq!(errata.core_online(&hw, 0), 0);
    let first = FAM17H_M01H_ENABLE.map(|(msr, _)| hw.msr(0, msr));
    let writes = hw.writes_to(0, FAM17H_M01H_ENABLE[0].0).len();

    // Redelivered online neither rewrites nor forgets the firmware values.
    assert_eq!(errata.core_online(&hw, 0), 0);
    assert_eq!(FAM17H_M01H_ENABLE.map(|(msr, _)| hw.msr(0, msr)), first);
    assert_eq!(hw.writes_to(0, FAM17H_M01H_ENABLE[0].0).len(), writes);

    assert_eq!(errata.core_offline(&hw, 0), 0);
    assert_eq!(hw.msr(0, FAM17H_M01H_ENABLE[0].0), 0x5);
    assert_eq!(hw.msr(0, FAM17H_M01H_ENABLE[1].0), 0);
}

#[test]
fn test_fam17h_m01h_teardown_restores_every_core() {
    let (hw, errata) = fam17h();
    errata.install(&hw).unwrap();
    errata.core_online(&hw, 0);
    errata.core_online(&hw, 1);

    errata.teardown(&hw);
    for core in 0..2 {
        for (msr, _) in FAM17H_M01H_ENABLE {
            assert_eq!(hw.msr(core, msr), 0);
        }
    }
    // Nothing left to restore.
    assert_eq!(errata.core_offline(&hw, 0), 0);
}

#[test]
fn test_fam17h_m01h_install_failure() {
    let (hw, errata) = fam17h();
    hw.fail_msr(FAM17H_M01H_ENABLE[2].0);
    let err = errata.install(&hw).err().unwrap();
    assert!(matches!(
        err,
        Error::Workaround {
            erratum: Erratum::Fam17hM01h,
            ..
        }
    ));
}

#[test]
fn test_core_online_failure_is_counted() {
    let (hw, errata) = fam17h();
    hw.fail_msr(FAM17H_M01H_ENABLE[1].0);
    assert_eq!(errata.core_online(&hw, 1), 1);
}

#[test]
fn test_fam10h_err_420_before_disable() {
    let hw = SimHardware::zen(1);
    let errata = Workarounds::for_flags(&WorkaroundFlags {
        fam10h_err_420: true,
        ..WorkaroundFlags::default()
    });
    let ctl = IBS_FETCH_EN | 0x1234;
    errata.before_disable(&hw, 0, Flavor::Fetch, ctl).unwrap();
    assert_eq!(hw.writes_to(0, IBS_FETCH_CTL), [IBS_FETCH_EN]);
}

#[test]
fn test_fam15h_err_718_ignores_fetch() {
    let hw = SimHardware::zen(1);
    let errata = Workarounds::for_flags(&WorkaroundFlags {
        fam15h_err_718: true,
        ..WorkaroundFlags::default()
    });
    let mut record = LocalRecord::new(Flavor::Fetch);
    record.set(0, IBS_OP_DATA3_STICKY);
    assert_eq!(errata.capture(&hw, 0, &mut record), 0);
    assert!(hw.writes_to(0, IBS_OP_DATA3).is_empty());
}

#[test]
fn test_default_hooks() -> io::Result<()> {
    let hw = SimHardware::zen(1);
    let strategy = Fam10hErr420;
    strategy.on_install(&hw)?;
    strategy.on_core_online(&hw, 0)?;
    strategy.on_core_offline(&hw, 0)?;
    strategy.on_teardown(&hw);
    assert!(hw.writes_to(0, IBS_OP_CTL).is_empty());
    Ok(())
}
