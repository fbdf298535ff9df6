//! App name to package name mapping for supported applications.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Mapping from app display names (and common aliases) to Android package names.
///
/// The registry is process-wide and immutable. Lookups are exact-match on the
/// label the model emits; aliases cover the spellings observed in practice.
pub static APP_PACKAGES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut m = HashMap::new();

    // Social & Messaging
    m.insert("微信", "com.tencent.mm");
    m.insert("WeChat", "com.tencent.mm");
    m.insert("QQ", "com.tencent.mobileqq");
    m.insert("微博", "com.sina.weibo");
    m.insert("Weibo", "com.sina.weibo");

    // E-commerce
    m.insert("淘宝", "com.taobao.taobao");
    m.insert("Taobao", "com.taobao.taobao");
    m.insert("京东", "com.jingdong.app.mall");
    m.insert("拼多多", "com.xunmeng.pinduoduo");

    // Lifestyle & Social
    m.insert("小红书", "com.xingin.xhs");
    m.insert("豆瓣", "com.douban.frodo");
    m.insert("知乎", "com.zhihu.android");

    // Maps & Navigation
    m.insert("高德地图", "com.autonavi.minimap");
    m.insert("百度地图", "com.baidu.BaiduMap");

    // Food & Services
    m.insert("美团", "com.sankuai.meituan");
    m.insert("大众点评", "com.dianping.v1");
    m.insert("饿了么", "me.ele");

    // Travel
    m.insert("携程", "ctrip.android.view");
    m.insert("铁路12306", "com.MobileTicket");
    m.insert("12306", "com.MobileTicket");
    m.insert("去哪儿", "com.Qunar");
    m.insert("滴滴出行", "com.sdu.did.psnger");

    // Video & Entertainment
    m.insert("bilibili", "tv.danmaku.bili");
    m.insert("哔哩哔哩", "tv.danmaku.bili");
    m.insert("抖音", "com.ss.android.ugc.aweme");
    m.insert("Douyin", "com.ss.android.ugc.aweme");
    m.insert("快手", "com.smile.gifmaker");
    m.insert("腾讯视频", "com.tencent.qqlive");
    m.insert("爱奇艺", "com.qiyi.video");
    m.insert("优酷视频", "com.youku.phone");

    // Music & Audio
    m.insert("网易云音乐", "com.netease.cloudmusic");
    m.insert("QQ音乐", "com.tencent.qqmusic");
    m.insert("喜马拉雅", "com.ximalaya.ting.android");

    // Reading
    m.insert("番茄小说", "com.dragon.read");
    m.insert("番茄免费小说", "com.dragon.read");

    // Productivity
    m.insert("飞书", "com.ss.android.lark");
    m.insert("QQ邮箱", "com.tencent.androidqqmail");

    // Browsers & Settings
    m.insert("Chrome", "com.android.chrome");
    m.insert("设置", "com.android.settings");
    m.insert("Settings", "com.android.settings");

    m
});

/// Resolve a human-readable app name to its package identifier.
pub fn resolve(name: &str) -> Option<&'static str> {
    APP_PACKAGES.get(name).copied()
}

/// List the app labels the registry recognizes, sorted for stable display.
pub fn list_supported() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = APP_PACKAGES.keys().copied().collect();
    names.sort_unstable();
    names
}

/// Reverse lookup: find a display name for a package id, if curated.
pub fn display_name(package: &str) -> Option<&'static str> {
    APP_PACKAGES
        .iter()
        .find(|(_, pkg)| **pkg == package)
        .map(|(name, _)| *name)
}
